/// Split a tag interior on its natural separator.
///
/// First pass picks the separator at bracket depth 0: `||` wins over
/// `|`, which wins over `,`. Second pass splits at depth 0 only, so
/// nested `<…>` tags stay intact. Parts are trimmed; empties are
/// kept for callers with positional semantics.
pub fn split_smart(input: &str) -> Vec<String> {
    let separator = pick_separator(input);
    split_on(input, separator)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Separator {
    DoublePipe,
    Pipe,
    Comma,
}

fn pick_separator(input: &str) -> Separator {
    let bytes = input.as_bytes();
    let mut depth = 0i32;
    let mut saw_pipe = false;
    let mut saw_comma = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'<' => depth += 1,
            b'>' => depth -= 1,
            b'|' if depth == 0 => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'|' {
                    return Separator::DoublePipe;
                }
                saw_pipe = true;
            }
            b',' if depth == 0 => saw_comma = true,
            _ => {}
        }
        i += 1;
    }
    if saw_pipe {
        Separator::Pipe
    } else if saw_comma {
        Separator::Comma
    } else {
        Separator::Comma
    }
}

fn split_on(input: &str, separator: Separator) -> Vec<String> {
    let bytes = input.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'<' => depth += 1,
            b'>' => depth -= 1,
            b'|' if depth == 0 && separator == Separator::DoublePipe => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'|' {
                    parts.push(input[start..i].trim().to_string());
                    i += 2;
                    start = i;
                    continue;
                }
            }
            b'|' if depth == 0 && separator == Separator::Pipe => {
                parts.push(input[start..i].trim().to_string());
                start = i + 1;
            }
            b',' if depth == 0 && separator == Separator::Comma => {
                parts.push(input[start..i].trim().to_string());
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(input[start..].trim().to_string());
    parts
}

/// Split with the `||` > `|` > `,` precedence, dropping empties —
/// the form sequence cursors and option lists want.
pub fn split_smart_non_empty(input: &str) -> Vec<String> {
    split_smart(input)
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect()
}

/// Find the next balanced `<…>` tag in `text`. Returns the byte
/// offsets of `<` and its matching `>`.
pub fn next_tag(text: &str) -> Option<(usize, usize)> {
    let open = text.find('<')?;
    let close = find_closing(&text[open..])?;
    Some((open, open + close))
}

/// Given a string starting at `<`, find the byte offset of the `>`
/// closing it, accounting for nested tags. `None` if unbalanced.
pub fn find_closing(text: &str) -> Option<usize> {
    let mut depth = 0i32;
    for (i, byte) in text.bytes().enumerate() {
        match byte {
            b'<' => depth += 1,
            b'>' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Decompose a tag interior `prefix[predata]:data` into its pieces.
/// The prefix comes back lowercased; `data` is `None` when the tag
/// has no colon.
pub fn split_tag_interior(interior: &str) -> (String, String, Option<&str>) {
    let (head, data) = match interior.split_once(':') {
        Some((head, data)) => (head, Some(data)),
        None => (interior, None),
    };
    let (prefix, pre_data) = match head.find('[') {
        Some(open) if head.ends_with(']') => {
            (&head[..open], head[open + 1..head.len() - 1].to_string())
        }
        _ => (head, String::new()),
    };
    (prefix.trim().to_ascii_lowercase(), pre_data, data)
}
