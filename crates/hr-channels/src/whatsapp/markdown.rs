//! Coercion between WhatsApp inline formatting and canonical markdown.
//!
//! WhatsApp uses `*bold*` and `~strike~`; canonical markdown uses `**bold**`
//! and `~~strike~~`. `_italic_` is identical in both dialects and passes
//! through untouched. Both directions are deterministic and idempotent:
//! doubled markers are treated as literals by the scanner, so re-coercing
//! already-coerced text is a no-op. Nested inline markers are ambiguous in
//! both dialects and are deliberately left as-is.

/// Convert WhatsApp inline formatting to canonical markdown.
pub fn wa_to_markdown(text: &str) -> String {
    double_single_markers(&double_single_markers(text, '*'), '~')
}

/// Convert canonical markdown to WhatsApp inline formatting.
pub fn markdown_to_wa(text: &str) -> String {
    halve_double_markers(&halve_double_markers(text, '*'), '~')
}

/// Rewrite `<m>span</m>` as `<mm>span</mm>` for single (non-doubled)
/// occurrences of `m`. Unpaired or doubled markers are left alone.
fn double_single_markers(text: &str, marker: char) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut i = 0;

    while i < chars.len() {
        if is_single_marker(&chars, i, marker) {
            if let Some(j) = find_closing_single(&chars, i + 1, marker) {
                if j > i + 1 {
                    out.push(marker);
                    out.push(marker);
                    out.extend(&chars[i + 1..j]);
                    out.push(marker);
                    out.push(marker);
                    i = j + 1;
                    continue;
                }
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// Rewrite `<mm>span</mm>` as `<m>span</m>`.
fn halve_double_markers(text: &str, marker: char) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        if is_double_marker(&chars, i, marker) {
            if let Some(j) = find_closing_double(&chars, i + 2, marker) {
                if j > i + 2 {
                    out.push(marker);
                    out.extend(&chars[i + 2..j]);
                    out.push(marker);
                    i = j + 2;
                    continue;
                }
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

fn is_single_marker(chars: &[char], i: usize, marker: char) -> bool {
    chars[i] == marker
        && chars.get(i + 1).copied() != Some(marker)
        && (i == 0 || chars[i - 1] != marker)
}

fn is_double_marker(chars: &[char], i: usize, marker: char) -> bool {
    chars[i] == marker
        && chars.get(i + 1).copied() == Some(marker)
        && chars.get(i + 2).copied() != Some(marker)
        && (i == 0 || chars[i - 1] != marker)
}

fn find_closing_single(chars: &[char], from: usize, marker: char) -> Option<usize> {
    let mut i = from;
    while i < chars.len() {
        if chars[i] == '\n' {
            return None;
        }
        if is_single_marker(chars, i, marker) {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn find_closing_double(chars: &[char], from: usize, marker: char) -> Option<usize> {
    let mut i = from;
    while i + 1 < chars.len() {
        if chars[i] == '\n' {
            return None;
        }
        if is_double_marker(chars, i, marker) {
            return Some(i);
        }
        i += 1;
    }
    None
}
