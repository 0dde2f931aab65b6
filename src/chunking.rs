//! Prompt splitting for inputs larger than the chat box accepts
//!
//! An oversized prompt is sent as a series of labeled turns. Every non-final
//! turn tells the remote side to hold off; the final one asks it to process
//! all parts together. Only the final turn's answer is kept.

#[cfg(test)]
mod proptests;

/// Room kept free in every message for the part label and guidance lines
pub const PART_HEADER_BUDGET: usize = 128;

/// One slice of a split prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPart {
    /// 1-based
    pub index: usize,
    pub total: usize,
    /// What gets sent
    pub text: String,
    /// Whitespace consumed at the break after `text`
    pub gap: String,
    pub is_final: bool,
}

impl PromptPart {
    fn single(prompt: &str) -> Self {
        Self {
            index: 1,
            total: 1,
            text: prompt.to_string(),
            gap: String::new(),
            is_final: true,
        }
    }

    /// The exact slice of the original prompt this part covers
    pub fn raw(&self) -> String {
        format!("{}{}", self.text, self.gap)
    }

    pub fn label(&self) -> String {
        if self.is_final {
            format!("[Part {}/{} - Final]", self.index, self.total)
        } else {
            format!("[Part {}/{}]", self.index, self.total)
        }
    }

    /// Message text for this part. A lone part is sent unlabeled.
    pub fn render(&self, final_instruction: Option<&str>) -> String {
        if self.total == 1 {
            return decorate(&self.text, final_instruction);
        }

        let mut message = format!("{}\n{}\n", self.label(), self.text);
        if self.is_final {
            message.push_str("Now process all parts above as a single prompt.");
            if let Some(instruction) = final_instruction {
                message.push('\n');
                message.push_str(instruction);
            }
        } else {
            message.push_str(&format!(
                "Do not respond yet. Wait until you receive Part {total}/{total}.",
                total = self.total
            ));
        }
        message
    }
}

/// Splits `prompt` into parts of at most `max_chars` characters each.
///
/// Breaks fall on the last whitespace run within budget; a word is only cut
/// when it alone exceeds the budget. `max_chars == 0` disables splitting.
pub fn split(prompt: &str, max_chars: usize) -> Vec<PromptPart> {
    let chars: Vec<char> = prompt.chars().collect();
    if max_chars == 0 || chars.len() <= max_chars {
        return vec![PromptPart::single(prompt)];
    }

    let mut pieces: Vec<(String, String)> = Vec::new();
    let mut pos = 0;
    while pos < chars.len() {
        if chars.len() - pos <= max_chars {
            pieces.push((chars[pos..].iter().collect(), String::new()));
            break;
        }
        let limit = pos + max_chars;
        match break_point(&chars, pos, limit) {
            Some((text_end, next)) => {
                pieces.push((
                    chars[pos..text_end].iter().collect(),
                    chars[text_end..next].iter().collect(),
                ));
                pos = next;
            }
            None => {
                pieces.push((chars[pos..limit].iter().collect(), String::new()));
                pos = limit;
            }
        }
    }

    let total = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, (text, gap))| PromptPart {
            index: i + 1,
            total,
            text,
            gap,
            is_final: i + 1 == total,
        })
        .collect()
}

/// End of the text and start of the next part for the last whitespace run
/// starting within `(pos, limit]`.
fn break_point(chars: &[char], pos: usize, limit: usize) -> Option<(usize, usize)> {
    let ws = (pos + 1..=limit)
        .rev()
        .find(|&i| i < chars.len() && chars[i].is_whitespace())?;

    let mut text_end = ws;
    while text_end > pos + 1 && chars[text_end - 1].is_whitespace() {
        text_end -= 1;
    }
    let mut next = ws;
    while next < chars.len() && chars[next].is_whitespace() {
        next += 1;
    }
    Some((text_end, next))
}

/// Appends `instruction` after a blank line unless the prompt already carries it.
pub fn decorate(prompt: &str, instruction: Option<&str>) -> String {
    let Some(instruction) = instruction else {
        return prompt.to_string();
    };
    if contains_ignore_case(prompt, instruction) {
        return prompt.to_string();
    }
    let base = prompt.trim_end();
    if base.is_empty() {
        instruction.to_string()
    } else {
        format!("{base}\n\n{instruction}")
    }
}

/// Builds the ordered messages to send for `prompt`.
///
/// Each rendered message stays within `max_chars`: the payload budget is
/// reduced by [`PART_HEADER_BUDGET`] and the instruction length.
pub fn plan_messages(prompt: &str, max_chars: usize, instruction: Option<&str>) -> Vec<String> {
    let instruction = instruction
        .map(str::trim)
        .filter(|i| !i.is_empty() && !contains_ignore_case(prompt, i));

    if max_chars == 0 || prompt.chars().count() <= max_chars {
        return vec![decorate(prompt, instruction)];
    }

    let instruction_len = instruction.map_or(0, |i| i.chars().count());
    let budget = max_chars
        .saturating_sub(PART_HEADER_BUDGET + instruction_len)
        .max(1);
    let parts = split(prompt, budget);
    tracing::debug!(
        parts = parts.len(),
        budget,
        prompt_chars = prompt.chars().count(),
        "Splitting oversized prompt"
    );
    parts.iter().map(|part| part.render(instruction)).collect()
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}
