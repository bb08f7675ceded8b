//! Invocation templates.
//!
//! The default invocation path builds its argv directly; templates exist
//! only for operator overrides. A template is whitespace-tokenized and
//! each token has its placeholders substituted as a whole argv element --
//! nothing is ever passed through a shell, so prompt contents cannot be
//! interpolated into command syntax.

use anyhow::{Result, bail};

/// Substitutions for one invocation.
#[derive(Debug, Clone)]
pub struct TemplateVars<'a> {
    pub cli: &'a str,
    pub prompt_file: &'a str,
    pub model: &'a str,
    pub session_id: Option<&'a str>,
}

/// Expand a template into an argv vector.
///
/// Tokens containing `{session_id}` are dropped entirely when no session
/// id is available, so templates can carry an optional `--resume
/// {session_id}` pair; the preceding flag token is dropped with it.
pub fn build_argv(template: &str, vars: &TemplateVars<'_>) -> Result<Vec<String>> {
    let tokens: Vec<&str> = template.split_whitespace().collect();
    if tokens.is_empty() {
        bail!("invocation template is empty");
    }

    let mut argv = Vec::with_capacity(tokens.len());
    let mut skip_next_for_session = false;

    for (i, token) in tokens.iter().enumerate() {
        if skip_next_for_session {
            skip_next_for_session = false;
            continue;
        }

        if token.contains("{session_id}") {
            match vars.session_id {
                Some(session_id) => {
                    argv.push(token.replace("{session_id}", session_id));
                }
                None => {
                    // Drop the flag that introduced this placeholder, if
                    // the previous token looks like one.
                    let trailing_flag = argv.last().is_some_and(|last| {
                        last.starts_with('-')
                            && tokens.get(i.wrapping_sub(1)).is_some_and(|p| p == last)
                    });
                    if trailing_flag {
                        argv.pop();
                    }
                }
            }
            continue;
        }

        // A lone "--resume"-style flag directly before a session token is
        // handled above; peek to drop it pre-emptively when the session is
        // absent.
        if vars.session_id.is_none()
            && token.starts_with('-')
            && tokens.get(i + 1).is_some_and(|n| n.contains("{session_id}"))
        {
            skip_next_for_session = true;
            continue;
        }

        argv.push(
            token
                .replace("{cli}", vars.cli)
                .replace("{prompt_file}", vars.prompt_file)
                .replace("{model}", vars.model),
        );
    }

    if argv.is_empty() {
        bail!("invocation template expanded to an empty argv");
    }
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars<'a>(session: Option<&'a str>) -> TemplateVars<'a> {
        TemplateVars {
            cli: "claude",
            prompt_file: "/tmp/prompt.md",
            model: "claude-sonnet-4-5",
            session_id: session,
        }
    }

    #[test]
    fn basic_expansion() {
        let argv = build_argv("{cli} -p --model {model} {prompt_file}", &vars(None)).unwrap();
        assert_eq!(
            argv,
            vec!["claude", "-p", "--model", "claude-sonnet-4-5", "/tmp/prompt.md"]
        );
    }

    #[test]
    fn session_id_expanded_when_present() {
        let argv = build_argv(
            "{cli} --resume {session_id} --model {model} {prompt_file}",
            &vars(Some("sess-1")),
        )
        .unwrap();
        assert_eq!(
            argv,
            vec![
                "claude",
                "--resume",
                "sess-1",
                "--model",
                "claude-sonnet-4-5",
                "/tmp/prompt.md"
            ]
        );
    }

    #[test]
    fn session_flag_dropped_when_absent() {
        let argv = build_argv(
            "{cli} --resume {session_id} --model {model} {prompt_file}",
            &vars(None),
        )
        .unwrap();
        assert_eq!(
            argv,
            vec!["claude", "--model", "claude-sonnet-4-5", "/tmp/prompt.md"]
        );
    }

    #[test]
    fn prompt_with_spaces_stays_single_argument() {
        // The placeholder is substituted into one token; a path with
        // spaces never splits because no shell is involved.
        let v = TemplateVars {
            prompt_file: "/tmp/my prompt.md",
            ..vars(None)
        };
        let argv = build_argv("{cli} {prompt_file}", &v).unwrap();
        assert_eq!(argv, vec!["claude", "/tmp/my prompt.md"]);
    }

    #[test]
    fn empty_template_is_an_error() {
        assert!(build_argv("   ", &vars(None)).is_err());
    }
}
