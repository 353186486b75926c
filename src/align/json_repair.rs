//! Best-effort recovery of JSON objects from model output
//!
//! Models wrap JSON in markdown fences, add prose around it, emit trailing
//! commas, Python literals, single quotes, raw newlines inside strings, or
//! stop mid-object when they hit an output limit. `extract_json` tries the
//! cheap paths first and only then runs the repair pass.

use serde_json::Value;

/// Extract a JSON object from model response text.
///
/// Tries, in order:
/// 1. Direct parse (response is pure JSON)
/// 2. Extract from a ```json ... ``` or ``` ... ``` fenced block
/// 3. Parse the first `{` to last `}` span
/// 4. Repair the text starting at the first `{` and parse the result
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();

    if let Some(v) = parse_object(trimmed) {
        return Some(v);
    }

    let fenced = fenced_block(trimmed);
    if let Some(block) = fenced {
        if let Some(v) = parse_object(block.trim()) {
            return Some(v);
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Some(v) = parse_object(&trimmed[start..=end]) {
                return Some(v);
            }
        }
    }

    let repaired = repair_json(fenced.unwrap_or(trimmed))?;
    parse_object(&repaired)
}

fn parse_object(text: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text).ok().filter(Value::is_object)
}

/// Content of the first fenced block; an unterminated fence runs to the end.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip the info string (`json`, `JSON`, ...) up to the first newline.
    let body = match after.find('\n') {
        Some(nl) if after[..nl].chars().all(|c| c.is_ascii_alphanumeric()) => &after[nl + 1..],
        _ => after,
    };
    Some(match body.find("```") {
        Some(end) => &body[..end],
        None => body,
    })
}

#[derive(Clone, Copy, PartialEq)]
enum Quote {
    Double,
    Single,
    Smart,
}

/// Rewrite near-JSON into parseable JSON.
///
/// Starts at the first `{` and stops once that object closes, so trailing
/// prose is dropped. Returns `None` when the text has no object at all.
pub fn repair_json(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut out = String::with_capacity(text.len() - start + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut quote: Option<Quote> = None;
    let mut chars = text[start..].chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            match c {
                '\\' => match chars.next() {
                    Some('\'') => out.push('\''),
                    Some(next) => {
                        out.push('\\');
                        out.push(next);
                    }
                    None => {}
                },
                '"' if q == Quote::Double || q == Quote::Smart => {
                    out.push('"');
                    quote = None;
                }
                '\'' if q == Quote::Single => {
                    out.push('"');
                    quote = None;
                }
                '\u{201D}' if q == Quote::Smart => {
                    out.push('"');
                    quote = None;
                }
                '"' => out.push_str("\\\""),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
                c => out.push(c),
            }
            continue;
        }

        match c {
            '"' => {
                quote = Some(Quote::Double);
                out.push('"');
            }
            '\'' => {
                quote = Some(Quote::Single);
                out.push('"');
            }
            '\u{201C}' | '\u{201D}' => {
                quote = Some(Quote::Smart);
                out.push('"');
            }
            '{' | '[' => {
                stack.push(if c == '{' { '}' } else { ']' });
                out.push(c);
            }
            '}' | ']' => {
                strip_trailing_comma(&mut out);
                // A mismatched closer is treated as closing the innermost open bracket.
                if let Some(closer) = stack.pop() {
                    out.push(closer);
                }
                if stack.is_empty() {
                    return Some(out);
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(match word.as_str() {
                    "True" => "true",
                    "False" => "false",
                    "None" => "null",
                    other => other,
                });
            }
            c => out.push(c),
        }
    }

    // Truncated output: close whatever is still open.
    if quote.is_some() {
        out.push('"');
    }
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(':') {
        out.push_str(" null");
    }
    while let Some(closer) = stack.pop() {
        strip_trailing_comma(&mut out);
        out.push(closer);
    }
    Some(out)
}

fn strip_trailing_comma(out: &mut String) {
    let trimmed_len = out.trim_end().len();
    if out[..trimmed_len].ends_with(',') {
        out.truncate(trimmed_len - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn direct_and_fenced_json() {
        assert_eq!(extract_json(r#"{"a": 1}"#), Some(json!({"a": 1})));
        let fenced = "Here you go:\n```json\n{\"a\": [1, 2]}\n```\nDone.";
        assert_eq!(extract_json(fenced), Some(json!({"a": [1, 2]})));
    }

    #[test]
    fn trailing_commas_are_removed() {
        let text = r#"{"questions": [{"n": 1,}, ], "next": 2,}"#;
        assert_eq!(
            extract_json(text),
            Some(json!({"questions": [{"n": 1}], "next": 2}))
        );
    }

    #[test]
    fn python_literals_and_single_quotes() {
        let text = "{'complete': True, 'partial': None, 'text': 'it\\'s \"here\"'}";
        assert_eq!(
            extract_json(text),
            Some(json!({"complete": true, "partial": null, "text": "it's \"here\""}))
        );
    }

    #[test]
    fn smart_quotes_and_raw_newlines() {
        let text = "{\u{201C}text\u{201D}: \"line one\nline two\"}";
        assert_eq!(extract_json(text), Some(json!({"text": "line one\nline two"})));
    }

    #[test]
    fn truncated_output_is_closed() {
        let text = "```json\n{\"questions\": [{\"question_number\": \"1\", \"question_text\": \"Expla";
        let value = extract_json(text).unwrap();
        assert_eq!(value["questions"][0]["question_text"], "Expla");

        let text = r#"{"questions": [], "next_question_paper_index":"#;
        let value = extract_json(text).unwrap();
        assert!(value["next_question_paper_index"].is_null());
    }

    #[test]
    fn trailing_prose_after_object_is_dropped() {
        let text = "{\"a\": 1} and then {\"b\": 2";
        assert_eq!(repair_json(text).as_deref(), Some("{\"a\": 1}"));
    }

    #[test]
    fn no_object_is_none() {
        assert_eq!(extract_json("I could not find any questions."), None);
        assert_eq!(extract_json("[1, 2, 3]"), None);
    }
}
