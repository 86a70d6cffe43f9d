//! JSON Repair
//!
//! Text-level repairs for model output:
//! - Markdown code fence wrapping (```json ... ```)
//! - Trailing commas before `]` or `}`
//! - JSON embedded in explanatory text (balanced brace walk)
//! - Truncated output (cut at the last complete element, close open containers)

/// Trim, strip a BOM and markdown code fences
pub fn preprocess(raw: &str) -> String {
    let s = raw.trim().trim_start_matches('\u{feff}').trim();
    strip_code_fences(s).trim().to_string()
}

/// Strip markdown code fences
pub fn strip_code_fences(s: &str) -> String {
    let mut result = s.to_string();

    // ```json ... ``` or ``` ... ```
    if result.starts_with("```")
        && let Some(first_newline) = result.find('\n')
    {
        result = result[first_newline + 1..].to_string();
    }

    if result.ends_with("```") {
        result = result[..result.len() - 3].trim_end().to_string();
    }

    result
}

/// Fix trailing commas before ] or }
pub fn fix_trailing_commas(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let chars: Vec<char> = s.chars().collect();
    let mut in_string = false;
    let mut escape = false;

    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];

        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
        } else if ch == '"' {
            in_string = true;
        } else if ch == ',' {
            // Look ahead, skipping whitespace
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }

            if j < chars.len() && (chars[j] == ']' || chars[j] == '}') {
                i += 1;
                continue;
            }
        }

        result.push(ch);
        i += 1;
    }

    result
}

/// Substring from the first `{` to its matching `}`, honoring strings and
/// escapes. `None` when the object never closes.
pub fn extract_balanced_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;

    for (i, ch) in s[start..].char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&s[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

// =============================================================================
// Truncation Repair
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Object,
    Array,
}

/// Position inside the innermost container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Key,
    Colon,
    Value,
    Separator,
}

/// Repair output that stops mid-document.
///
/// Scans from the first `{`, remembering the last position where the text
/// could end with every open container closed: right after a closed value
/// string, after a closed object or array, just before a separating comma,
/// or right after an opening bracket. The text is cut there and the missing
/// closers are appended. Returns `None` if no `{` is present.
pub fn repair_truncated(s: &str) -> Option<String> {
    let start = s.find('{')?;
    let body = &s[start..];

    let mut stack: Vec<(Container, Expect)> = Vec::new();
    let mut in_string = false;
    let mut string_is_key = false;
    let mut escape = false;
    let mut last_safe: Option<(usize, String)> = None;

    let closers = |stack: &[(Container, Expect)]| -> String {
        stack
            .iter()
            .rev()
            .map(|(c, _)| match c {
                Container::Object => '}',
                Container::Array => ']',
            })
            .collect()
    };

    for (i, ch) in body.char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
                if let Some(top) = stack.last_mut() {
                    if string_is_key {
                        top.1 = Expect::Colon;
                    } else {
                        top.1 = Expect::Separator;
                        last_safe = Some((i + 1, closers(&stack)));
                    }
                }
            }
            continue;
        }

        match ch {
            '"' => {
                in_string = true;
                string_is_key = matches!(stack.last(), Some((Container::Object, Expect::Key)));
            }
            '{' | '[' => {
                let container = if ch == '{' {
                    Container::Object
                } else {
                    Container::Array
                };
                let expect = match container {
                    Container::Object => Expect::Key,
                    Container::Array => Expect::Value,
                };
                stack.push((container, expect));
                last_safe = Some((i + 1, closers(&stack)));
            }
            '}' | ']' => {
                stack.pop();
                if let Some(top) = stack.last_mut() {
                    top.1 = Expect::Separator;
                }
                last_safe = Some((i + 1, closers(&stack)));
                if stack.is_empty() {
                    break;
                }
            }
            ':' => {
                if let Some(top) = stack.last_mut() {
                    top.1 = Expect::Value;
                }
            }
            ',' => {
                // Everything before a separator is complete (including bare
                // numbers and literals, which have no closing delimiter)
                last_safe = Some((i, closers(&stack)));
                if let Some(top) = stack.last_mut() {
                    top.1 = match top.0 {
                        Container::Object => Expect::Key,
                        Container::Array => Expect::Value,
                    };
                }
            }
            _ => {}
        }
    }

    let (cut, closing) = last_safe?;
    let mut repaired = body[..cut].trim_end().to_string();
    repaired.push_str(&closing);
    Some(fix_trailing_commas(&repaired))
}
