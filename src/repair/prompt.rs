use crate::sandbox::env::FILE_VARIABLE;
use crate::sandbox::CapabilityEnvironment;

pub fn system_prompt(env: &CapabilityEnvironment) -> String {
    let allow = env.allow_list();
    let handles = allow
        .bindings()
        .iter()
        .map(|b| format!("`{}` ({})", b.name, b.module))
        .collect::<Vec<_>>()
        .join(", ");
    let modules = allow.modules().collect::<Vec<_>>().join(", ");

    let mut prompt = format!(
        "You are a data analyst. You answer questions about the user's uploaded file by writing Python that is executed for you.

## RULES

1. Put all code in ONE fenced block labelled ```python. Code in several blocks is joined and run as a single program.
2. Print what the user needs to see. The value of the last line is also shown when it is a plain expression.
3. These names are already defined: {handles}. Only these modules can be imported: {modules}.
4. open(), eval(), exec(), input() and the os, sys, subprocess and shutil modules are not available. Read files with the library readers (for example pd.read_csv).
5. If your code fails you will get the error back. Reply with a complete, corrected program: nothing from a previous attempt is kept.
6. Explain the results in plain language after the code. Answer in the user's language."
    );

    if env.file_path().is_some() {
        prompt.push_str(&format!(
            "\n\nThe uploaded file's path is in the variable `{}`.",
            FILE_VARIABLE
        ));
    }

    prompt
}

/// Attached to the user's last turn when a file is available.
pub fn file_note(file_name: &str, preview: Option<&str>) -> String {
    let mut note = format!(
        "\n\n[Uploaded file: {} (path in `{}`)]",
        file_name, FILE_VARIABLE
    );
    if let Some(preview) = preview {
        note.push_str(&format!("\nFirst part of the file:\n```\n{}\n```", preview));
    }
    note
}

/// The user-role turn that asks for a corrected attempt.
pub fn correction_request(code: &str, failure: &str, attempt: usize, ceiling: usize) -> String {
    format!(
        "The code from your last reply failed (attempt {attempt} of {ceiling}).

Code that ran:
```python
{code}
```

Error:
```text
{failure}
```

Fix the problem and reply with the complete corrected program in a single ```python block. Variables from the failed attempt do not exist any more, so the program must be self-contained."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::AllowList;

    #[test]
    fn test_system_prompt_lists_capabilities() {
        let env = CapabilityEnvironment::new(AllowList::default());
        let prompt = system_prompt(&env);
        assert!(prompt.contains("`pd` (pandas)"));
        assert!(prompt.contains("statistics"));
        assert!(!prompt.contains(FILE_VARIABLE));
    }

    #[test]
    fn test_correction_request_carries_failure() {
        let req = correction_request("print(x)", "NameError: name 'x' is not defined", 2, 5);
        assert!(req.contains("attempt 2 of 5"));
        assert!(req.contains("```python\nprint(x)\n```"));
        assert!(req.contains("NameError"));
        assert!(req.contains("self-contained"));
    }

    #[test]
    fn test_file_note_with_preview() {
        let note = file_note("sales.csv", Some("a,b\n1,2"));
        assert!(note.contains("sales.csv"));
        assert!(note.contains("a,b\n1,2"));
        assert!(file_note("x.pdf", None).ends_with("(path in `FILE_PATH`)]"));
    }
}
