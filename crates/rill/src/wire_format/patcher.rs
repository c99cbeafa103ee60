//! Reference consumer of the document stream: applies out-of-order segments
//! and late client-render instructions the way a browser-side runtime
//! would, producing the document a reader finally sees.

use rustc_hash::{FxHashMap, FxHashSet};

use super::escape::{escape_attribute, unescape_attribute, unescape_script_string};
use crate::error::RillError;

const SEGMENT_OPEN: &str = "<div hidden id=\"";
const COMPLETE_OPEN: &str = "<script>$RC(";
const CLIENT_RENDER_OPEN: &str = "<script>$RX(";
const SCRIPT_CLOSE: &str = "</script>";
const PENDING_START: &str = "<!--$?-->";
const BOUNDARY_END: &str = "<!--/$-->";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Instruction {
    Complete { boundary: String, segment: String },
    ClientRender { boundary: String, digest: Option<String>, message: Option<String> },
}

#[derive(Debug, Default)]
struct Parsed {
    document: String,
    segments: FxHashMap<String, String>,
    instructions: Vec<Instruction>,
}

pub fn apply_patches(stream: &str) -> Result<String, RillError> {
    let Parsed { mut document, mut segments, instructions } = parse(stream)?;
    let mut settled: FxHashSet<String> = FxHashSet::default();

    for instruction in instructions {
        match instruction {
            Instruction::Complete { boundary, segment } => {
                let content = segments.remove(&segment).ok_or_else(|| {
                    RillError::deserialization(format!(
                        "Completion of {boundary} references unknown segment {segment}"
                    ))
                })?;

                if !settled.insert(boundary.clone()) {
                    continue;
                }

                if let Some((start, end)) = find_pending_region(&document, &boundary)? {
                    document.replace_range(start..end, &format!("<!--$-->{content}{BOUNDARY_END}"));
                }
            }
            Instruction::ClientRender { boundary, digest, message } => {
                if !settled.insert(boundary.clone()) {
                    continue;
                }

                let marker = format!("{PENDING_START}<template id=\"{}\"></template>", escape_attribute(&boundary));
                if let Some(start) = document.find(&marker) {
                    let mut replacement = String::from("<!--$!--><template");
                    if let Some(digest) = digest {
                        replacement.push_str(&format!(" data-dgst=\"{}\"", escape_attribute(&digest)));
                    }
                    if let Some(message) = message {
                        replacement.push_str(&format!(" data-msg=\"{}\"", escape_attribute(&message)));
                    }
                    replacement.push_str("></template>");
                    document.replace_range(start..start + marker.len(), &replacement);
                }
            }
        }
    }

    Ok(document)
}

fn parse(stream: &str) -> Result<Parsed, RillError> {
    let mut parsed = Parsed::default();
    let mut rest = stream;

    loop {
        let next = [SEGMENT_OPEN, COMPLETE_OPEN, CLIENT_RENDER_OPEN]
            .iter()
            .filter_map(|token| rest.find(token).map(|at| (at, *token)))
            .min_by_key(|(at, _)| *at);

        let Some((at, token)) = next else {
            parsed.document.push_str(rest);
            break;
        };

        parsed.document.push_str(&rest[..at]);
        let after = &rest[at + token.len()..];

        rest = if token == SEGMENT_OPEN {
            let (id, content, remaining) = read_segment(after)?;
            parsed.segments.insert(id, content.to_string());
            remaining
        } else {
            let close = after.find(SCRIPT_CLOSE).ok_or_else(|| {
                RillError::deserialization("Unterminated instruction script".to_string())
            })?;
            let args = read_arguments(&after[..close])?;
            parsed.instructions.push(instruction_from(token, args)?);
            &after[close + SCRIPT_CLOSE.len()..]
        };
    }

    Ok(parsed)
}

fn read_segment(input: &str) -> Result<(String, &str, &str), RillError> {
    let id_end = input
        .find("\">")
        .ok_or_else(|| RillError::deserialization("Malformed segment container".to_string()))?;
    let id = unescape_attribute(&input[..id_end]);
    let body = &input[id_end + 2..];

    let mut depth = 1usize;
    let mut cursor = 0usize;
    while depth > 0 {
        let open = find_div_open(&body[cursor..]).map(|at| cursor + at);
        let close = body[cursor..].find("</div>").map(|at| cursor + at);

        match (open, close) {
            (Some(open), Some(close)) if open < close => {
                depth += 1;
                cursor = open + 4;
            }
            (_, Some(close)) => {
                depth -= 1;
                if depth == 0 {
                    return Ok((id, &body[..close], &body[close + "</div>".len()..]));
                }
                cursor = close + "</div>".len();
            }
            (_, None) => break,
        }
    }

    Err(RillError::deserialization(format!("Unterminated segment container {id}")))
}

fn find_div_open(input: &str) -> Option<usize> {
    let mut offset = 0;
    while let Some(at) = input[offset..].find("<div") {
        let position = offset + at;
        match input[position + 4..].chars().next() {
            Some('>' | ' ' | '\t' | '\n') => return Some(position),
            _ => offset = position + 4,
        }
    }
    None
}

fn read_arguments(input: &str) -> Result<Vec<String>, RillError> {
    let body = input
        .strip_suffix(')')
        .ok_or_else(|| RillError::deserialization(format!("Malformed instruction: {input}")))?;

    let mut args = Vec::new();
    let mut chars = body.char_indices();

    while let Some((_, c)) = chars.next() {
        match c {
            '"' => {
                let mut raw = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        '\\' => {
                            raw.push('\\');
                            if let Some((_, escaped)) = chars.next() {
                                raw.push(escaped);
                            }
                        }
                        '"' => {
                            closed = true;
                            break;
                        }
                        other => raw.push(other),
                    }
                }
                if !closed {
                    return Err(RillError::deserialization(format!(
                        "Unterminated string in instruction: {input}"
                    )));
                }
                args.push(unescape_script_string(&raw));
            }
            ',' | ' ' => {}
            other => {
                return Err(RillError::deserialization(format!(
                    "Unexpected '{other}' in instruction: {input}"
                )));
            }
        }
    }

    Ok(args)
}

fn instruction_from(token: &str, mut args: Vec<String>) -> Result<Instruction, RillError> {
    if args.is_empty() {
        return Err(RillError::deserialization("Instruction without a boundary id".to_string()));
    }

    let boundary = args.remove(0);
    let mut args = args.into_iter();

    if token == COMPLETE_OPEN {
        let segment = args.next().ok_or_else(|| {
            RillError::deserialization(format!("Completion of {boundary} is missing a segment"))
        })?;
        Ok(Instruction::Complete { boundary, segment })
    } else {
        let digest = args.next().filter(|digest| !digest.is_empty());
        let message = args.next();
        Ok(Instruction::ClientRender { boundary, digest, message })
    }
}

/// Byte range of the pending boundary whose template carries `boundary`,
/// from its opening comment through the matching end comment.
fn find_pending_region(document: &str, boundary: &str) -> Result<Option<(usize, usize)>, RillError> {
    let marker = format!("{PENDING_START}<template id=\"{}\"></template>", escape_attribute(boundary));
    let Some(start) = document.find(&marker) else {
        return Ok(None);
    };

    let mut depth = 1usize;
    let mut cursor = start + marker.len();

    while depth > 0 {
        let open = document[cursor..].find("<!--$").map(|at| cursor + at);
        let close = document[cursor..].find(BOUNDARY_END).map(|at| cursor + at);

        match (open, close) {
            (Some(open), Some(close)) if open < close => {
                depth += 1;
                cursor = open + "<!--$".len();
            }
            (_, Some(close)) => {
                depth -= 1;
                cursor = close + BOUNDARY_END.len();
            }
            (_, None) => {
                return Err(RillError::deserialization(format!(
                    "Boundary {boundary} is never closed"
                )));
            }
        }
    }

    Ok(Some((start, cursor)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_without_patches_is_untouched() {
        let html = "<main><!--$-->done<!--/$--></main>";
        assert_eq!(apply_patches(html).expect("patch"), html);
    }

    #[test]
    fn test_completed_segment_replaces_fallback() {
        let stream = concat!(
            "<main><!--$?--><template id=\"B:1\"></template>Loading<!--/$--></main>",
            "<div hidden id=\"S:2\"><p>Ready</p></div>",
            "<script>$RC(\"B:1\",\"S:2\")</script>"
        );

        assert_eq!(
            apply_patches(stream).expect("patch"),
            "<main><!--$--><p>Ready</p><!--/$--></main>"
        );
    }

    #[test]
    fn test_nested_boundaries_patch_in_any_order() {
        let stream = concat!(
            "<!--$?--><template id=\"B:1\"></template>outer<!--/$-->",
            "<div hidden id=\"S:2\"><div>a<!--$?--><template id=\"B:3\"></template>inner<!--/$--></div></div>",
            "<script>$RC(\"B:1\",\"S:2\")</script>",
            "<div hidden id=\"S:4\">b</div>",
            "<script>$RC(\"B:3\",\"S:4\")</script>"
        );

        assert_eq!(
            apply_patches(stream).expect("patch"),
            "<!--$--><div>a<!--$-->b<!--/$--></div><!--/$-->"
        );
    }

    #[test]
    fn test_client_render_keeps_fallback() {
        let stream = concat!(
            "<!--$?--><template id=\"B:1\"></template>Loading<!--/$-->",
            "<script>$RX(\"B:1\",\"abc\",\"went \\\"wrong\\\"\")</script>"
        );

        assert_eq!(
            apply_patches(stream).expect("patch"),
            "<!--$!--><template data-dgst=\"abc\" data-msg=\"went &quot;wrong&quot;\"></template>Loading<!--/$-->"
        );
    }

    #[test]
    fn test_each_boundary_settles_once() {
        let stream = concat!(
            "<!--$?--><template id=\"B:1\"></template>x<!--/$-->",
            "<div hidden id=\"S:2\">first</div><script>$RC(\"B:1\",\"S:2\")</script>",
            "<div hidden id=\"S:3\">second</div><script>$RC(\"B:1\",\"S:3\")</script>",
            "<script>$RX(\"B:1\")</script>"
        );

        assert_eq!(apply_patches(stream).expect("patch"), "<!--$-->first<!--/$-->");
    }

    #[test]
    fn test_unknown_segment_is_an_error() {
        let stream = "<!--$?--><template id=\"B:1\"></template>x<!--/$--><script>$RC(\"B:1\",\"S:9\")</script>";
        assert!(apply_patches(stream).is_err());
    }

    #[test]
    fn test_unterminated_segment_is_an_error() {
        assert!(apply_patches("<div hidden id=\"S:1\"><div>open").is_err());
    }
}
