//! Appending execution evidence to a reply, and reading it back.
//!
//! Sections are wrapped in HTML comments so they stay invisible in rendered
//! markdown while remaining trivially machine-readable.

pub const RESULTS_MARKER: &str = "<!-- fixloop:execution-results -->";
pub const ERROR_MARKER: &str = "<!-- fixloop:execution-error -->";
pub const SECTION_END: &str = "<!-- /fixloop:section -->";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    Narrative(String),
    Results(String),
    Error(String),
}

/// A fence longer than any backtick run in `body`, so captured output can't
/// close it early.
fn fence_for(body: &str) -> String {
    let mut longest = 0;
    let mut run = 0;
    for c in body.chars() {
        if c == '`' {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    "`".repeat((longest + 1).max(3))
}

fn fenced(body: &str) -> String {
    let fence = fence_for(body);
    format!("{fence}text\n{}\n{fence}", body.trim_end())
}

fn append_section(reply: &str, marker: &str, body: &str) -> String {
    let mut out = String::with_capacity(reply.len() + body.len() + 96);
    out.push_str(reply.trim_end());
    out.push_str("\n\n");
    out.push_str(marker);
    out.push('\n');
    out.push_str(body);
    out.push('\n');
    out.push_str(SECTION_END);
    out
}

/// Reply followed by an "Execution results" section.
pub fn with_results(reply: &str, stdout: &str, result: Option<&str>) -> String {
    let mut body = String::from("**Execution results**\n\n");
    if stdout.trim().is_empty() {
        body.push_str("_(no output)_");
    } else {
        body.push_str(&fenced(stdout));
    }
    if let Some(result) = result {
        body.push_str("\n\n**Result**\n\n");
        body.push_str(&fenced(result));
    }
    append_section(reply, RESULTS_MARKER, &body)
}

/// Reply followed by an "Execution error" section with the failure detail
/// and an optional explanation of why no further attempt was made.
pub fn with_error(reply: &str, detail: &str, note: Option<&str>) -> String {
    let mut body = String::from("**Execution error**\n\n");
    body.push_str(&fenced(detail));
    if let Some(note) = note {
        body.push_str("\n\n");
        body.push_str(note);
    }
    append_section(reply, ERROR_MARKER, &body)
}

/// Split a transcript into narrative text and execution sections, in
/// display order. An unterminated section runs to the end of the text.
pub fn sections(text: &str) -> Vec<Section> {
    let mut out = Vec::new();
    let mut rest = text;

    loop {
        let next = [RESULTS_MARKER, ERROR_MARKER]
            .iter()
            .filter_map(|m| rest.find(m).map(|idx| (idx, *m)))
            .min_by_key(|(idx, _)| *idx);

        let Some((idx, marker)) = next else {
            if !rest.trim().is_empty() {
                out.push(Section::Narrative(rest.trim().to_string()));
            }
            return out;
        };

        let narrative = rest[..idx].trim();
        if !narrative.is_empty() {
            out.push(Section::Narrative(narrative.to_string()));
        }

        let after = &rest[idx + marker.len()..];
        let (body, remainder) = match after.find(SECTION_END) {
            Some(end) => (&after[..end], &after[end + SECTION_END.len()..]),
            None => (after, ""),
        };
        let body = body.trim().to_string();
        out.push(if marker == RESULTS_MARKER {
            Section::Results(body)
        } else {
            Section::Error(body)
        });
        rest = remainder;
    }
}
