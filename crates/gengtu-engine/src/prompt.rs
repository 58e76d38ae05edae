//! Role template and the two-stage parse of the text service's free-form
//! answer into an English / Chinese prompt pair.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::GenerationError;

/// Fenced block marker. Non-greedy and dot-matches-newline, so each
/// ```` ```json ... ``` ```` pair is one match in document order.
pub const PROMPT_BLOCK_PATTERN: &str = r"(?s)```json(.*?)```";

pub const ROLE_TEMPLATE: &str = "# 角色：看图猜谜梗图提示词设计师

你擅长利用谐音与双关，把一个词语拆成可被画出来的线索，并写成 AI 文生图提示词。

## 任务
- 用户给出谜底，你围绕谜底设计一道看图猜谜题，画面必须能让玩家推理出谜底。
- 成品是一张完整的手机益智游戏截图：垂直分为上下两联。
  - 上半部分（线索区）：只描绘一个单一、明确的主体，叠加清晰的中文文字“这是XX”。
  - 下半部分（谜面区）：包含线索区的主体与其他元素互动，叠加中文文字“这是_（N个字）”，N 为谜底字数。
- 风格统一为 16 位复古像素艺术（pixel art, 16-bit retro video game style）。
- 加入负面约束：NO garbled text, NO incorrect characters, NO merged panels, NO blurry image.

## 输出格式
1. 用英文小括号写出谜底。
2. 先给出英文提示词，再给出中文提示词，两段分别用 ```json 与 ``` 包裹，除此之外不要使用这种包裹。
3. 最后用一小段话说明设计思路。

## 开始
用户的输入是：谜底是";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPair {
    pub english: String,
    pub chinese: String,
}

pub fn build_instruction(answer: &str) -> String {
    format!("{ROLE_TEMPLATE}{}", answer.trim())
}

fn block_regex() -> &'static Regex {
    static BLOCK_RE: OnceLock<Regex> = OnceLock::new();
    BLOCK_RE.get_or_init(|| Regex::new(PROMPT_BLOCK_PATTERN).expect("prompt block pattern compiles"))
}

/// Stage one: every marked block body, untrimmed, in document order.
pub fn find_prompt_blocks(text: &str) -> Vec<&str> {
    block_regex()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|body| body.as_str()))
        .collect()
}

/// Stage two: require at least two blocks; the first is English, the second
/// (the one consumed downstream) is Chinese. Both are trimmed.
pub fn extract_prompt_pair(text: &str) -> Result<PromptPair, GenerationError> {
    let blocks = find_prompt_blocks(text);
    if blocks.len() < 2 {
        return Err(GenerationError::MalformedPromptFormat {
            found: blocks.len(),
        });
    }
    Ok(PromptPair {
        english: blocks[0].trim().to_string(),
        chinese: blocks[1].trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::{build_instruction, extract_prompt_pair, find_prompt_blocks, ROLE_TEMPLATE};
    use crate::error::GenerationError;

    const SAMPLE: &str = "### 谜底\n\n(炸弹)\n\n-----\n\n\
```json\nA vertically stacked diptych, pixel art.\n\nNO blurry image.\n```\n\n\
```json\n一个垂直堆叠的两联画，像素艺术。\n\n不要模糊图像。\n```\n\n\
### 设计思路\n弟弟 / 炸弹 谐音。";

    #[test]
    fn second_block_is_the_chinese_prompt() -> anyhow::Result<()> {
        let pair = extract_prompt_pair(SAMPLE)?;
        assert_eq!(
            pair.english,
            "A vertically stacked diptych, pixel art.\n\nNO blurry image."
        );
        assert_eq!(pair.chinese, "一个垂直堆叠的两联画，像素艺术。\n\n不要模糊图像。");
        Ok(())
    }

    #[test]
    fn extra_blocks_do_not_change_selection() -> anyhow::Result<()> {
        let text = "```json a ``` ```json  b  ``` ```json c ```";
        assert_eq!(find_prompt_blocks(text), vec![" a ", "  b  ", " c "]);
        assert_eq!(extract_prompt_pair(text)?.chinese, "b");
        Ok(())
    }

    #[test]
    fn fewer_than_two_blocks_is_malformed() {
        for (text, expected) in [
            ("no fences here", 0),
            ("```json\nonly one\n```", 1),
            ("```python\nnot json\n``` ```json one ```", 1),
        ] {
            match extract_prompt_pair(text) {
                Err(GenerationError::MalformedPromptFormat { found }) => assert_eq!(found, expected),
                other => panic!("unexpected result for {text:?}: {other:?}"),
            }
        }
    }

    #[test]
    fn unterminated_block_is_not_counted() {
        let text = "```json first ``` ```json second but never closed";
        assert_eq!(find_prompt_blocks(text).len(), 1);
    }

    #[test]
    fn instruction_appends_trimmed_answer() {
        let instruction = build_instruction("  苹果 \n");
        assert!(instruction.starts_with(ROLE_TEMPLATE));
        assert!(instruction.ends_with("谜底是苹果"));
    }
}
