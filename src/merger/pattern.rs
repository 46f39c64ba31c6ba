//! Win32 风格的文件名通配匹配。
//!
//! 支持 `*`、`?` 以及 DOS 通配符：`<`（匹配到最后一个 `.` 之前的任意字符）、
//! `>`（任意单个字符，遇到 `.` 或名字结尾时匹配零个字符）、
//! `"`（匹配 `.`，或在名字结尾匹配零个字符）。

/// 判断 `name` 是否匹配 `expression`
pub fn is_name_in_expression(expression: &str, name: &str, ignore_case: bool) -> bool {
    if expression.is_empty() || expression == "*" {
        return true;
    }

    let (pattern, text): (Vec<char>, Vec<char>) = if ignore_case {
        (
            expression.chars().flat_map(char::to_lowercase).collect(),
            name.chars().flat_map(char::to_lowercase).collect(),
        )
    } else {
        (expression.chars().collect(), name.chars().collect())
    };

    let last_dot = text.iter().rposition(|&c| c == '.');
    let mut memo = vec![None; (pattern.len() + 1) * (text.len() + 1)];
    matches_at(&pattern, &text, 0, 0, last_dot, &mut memo)
}

fn matches_at(
    pattern: &[char],
    text: &[char],
    p: usize,
    n: usize,
    last_dot: Option<usize>,
    memo: &mut [Option<bool>],
) -> bool {
    let key = p * (text.len() + 1) + n;
    if let Some(known) = memo[key] {
        return known;
    }

    let result = match pattern.get(p) {
        None => n == text.len(),
        Some('*') => (n..=text.len()).any(|i| matches_at(pattern, text, p + 1, i, last_dot, memo)),
        Some('<') => {
            // 不能越过名字中最后一个 '.'
            let limit = match last_dot {
                Some(dot) if dot >= n => dot,
                _ => text.len(),
            };
            (n..=limit).any(|i| matches_at(pattern, text, p + 1, i, last_dot, memo))
        }
        Some('?') => n < text.len() && matches_at(pattern, text, p + 1, n + 1, last_dot, memo),
        Some('>') => {
            if n == text.len() || text[n] == '.' {
                matches_at(pattern, text, p + 1, n, last_dot, memo)
            } else {
                matches_at(pattern, text, p + 1, n + 1, last_dot, memo)
            }
        }
        Some('"') => {
            if n == text.len() {
                matches_at(pattern, text, p + 1, n, last_dot, memo)
            } else {
                text[n] == '.' && matches_at(pattern, text, p + 1, n + 1, last_dot, memo)
            }
        }
        Some(&c) => n < text.len() && text[n] == c && matches_at(pattern, text, p + 1, n + 1, last_dot, memo),
    };

    memo[key] = Some(result);
    result
}
