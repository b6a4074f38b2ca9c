//! Reading a model reply: code blocks and text-level finalize lines.

/// Finalize written as plain text outside any code fence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextFinal {
    /// `FINAL(answer)`
    Value(String),
    /// `FINAL_VAR(name)`
    Variable(String),
}

#[derive(Debug)]
struct Fence<'a> {
    tag: &'a str,
    body: String,
}

/// Split a reply into fenced blocks and the text outside them.
/// An unterminated fence runs to the end of the reply.
fn scan(reply: &str) -> (Vec<Fence<'_>>, Vec<&str>) {
    let mut fences = Vec::new();
    let mut outside = Vec::new();
    let mut open: Option<Fence<'_>> = None;

    for line in reply.lines() {
        let trimmed = line.trim();
        match open.take() {
            Some(mut fence) => {
                if trimmed == "```" {
                    fences.push(fence);
                } else {
                    fence.body.push_str(line);
                    fence.body.push('\n');
                    open = Some(fence);
                }
            }
            None => {
                if let Some(tag) = trimmed.strip_prefix("```") {
                    open = Some(Fence {
                        tag: tag.trim(),
                        body: String::new(),
                    });
                } else {
                    outside.push(line);
                }
            }
        }
    }
    if let Some(fence) = open {
        fences.push(fence);
    }
    (fences, outside)
}

/// Code blocks to run, in reply order.
///
/// Fences tagged `repl` win. Without any, fences tagged `json` are used,
/// then untagged fences whose body looks like JSON.
pub fn extract_code_blocks(reply: &str) -> Vec<String> {
    let (fences, _) = scan(reply);

    let repl = bodies(&fences, |f| f.tag.eq_ignore_ascii_case("repl"));
    if !repl.is_empty() {
        return repl;
    }
    let json = bodies(&fences, |f| f.tag.eq_ignore_ascii_case("json"));
    if !json.is_empty() {
        return json;
    }
    bodies(&fences, |f| {
        let body = f.body.trim_start();
        f.tag.is_empty() && (body.starts_with('[') || body.starts_with('{'))
    })
}

fn bodies(fences: &[Fence<'_>], wanted: impl Fn(&Fence<'_>) -> bool) -> Vec<String> {
    fences
        .iter()
        .filter(|f| wanted(*f))
        .map(|f| f.body.trim().to_string())
        .filter(|body| !body.is_empty())
        .collect()
}

/// Text-level finalize, if a line outside fences starts with one.
///
/// The answer runs from the opening parenthesis to the last closing one,
/// so `FINAL(...)` may span several lines.
pub fn find_text_final(reply: &str) -> Option<TextFinal> {
    let (_, outside) = scan(reply);

    let start = outside.iter().position(|line| {
        let line = line.trim_start();
        line.starts_with("FINAL(") || line.starts_with("FINAL_VAR(")
    })?;

    let text = outside[start..].join("\n");
    let text = text.trim();
    if let Some(rest) = text.strip_prefix("FINAL_VAR(") {
        let name = rest.split(')').next()?.trim();
        let name = strip_quotes(name);
        return (!name.is_empty()).then(|| TextFinal::Variable(name.to_string()));
    }

    let rest = text.strip_prefix("FINAL(")?;
    let close = rest.rfind(')')?;
    let value = strip_quotes(rest[..close].trim());
    Some(TextFinal::Value(value.to_string()))
}

fn strip_quotes(s: &str) -> &str {
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return &s[1..s.len() - 1];
        }
    }
    s
}
