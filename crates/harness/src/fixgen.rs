//! Fix generation through an external command
//!
//! The command receives the `FixContext` as JSON on stdin and must print a
//! `FixSuggestion` as JSON on stdout:
//!
//! ```json
//! {"selector": ".btn-primary", "property": "background-color",
//!  "suggestedValue": "#3498db", "rationale": "..."}
//! ```

use crate::error::{HarnessError, HarnessResult};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};
use visfix_engine::{FixContext, FixGenerator, FixSuggestion};

#[derive(Debug, Clone)]
pub struct CommandFixGenerator {
    command: Vec<String>,
}

impl CommandFixGenerator {
    pub fn new(command: &[String]) -> Self {
        Self {
            command: command.to_vec(),
        }
    }

    pub async fn suggest(&self, context: &FixContext) -> HarnessResult<FixSuggestion> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or(HarnessError::NotConfigured("fix generator"))?;

        debug!("Requesting fix for {} from {}", context.record_id, program);
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Feed stdin from its own task while stdout and stderr drain, so a
        // generator that answers before reading everything cannot stall on a
        // full pipe
        let input = serde_json::to_vec(context)?;
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                match stdin.write_all(&input).await {
                    // A generator may exit without reading all of its input
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                    result => result,
                }
            })
        });

        let output = child.wait_with_output().await?;
        let written = match writer {
            Some(task) => task.await?,
            None => Ok(()),
        };
        if !output.status.success() {
            return Err(HarnessError::CommandFailed {
                program: program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        written?;

        let suggestion: FixSuggestion = serde_json::from_slice(&output.stdout)?;
        validate(&suggestion)?;

        info!(
            selector = %suggestion.selector,
            property = %suggestion.property,
            "Fix suggested for {}: {}",
            context.record_id,
            suggestion.suggested_value
        );
        Ok(suggestion)
    }
}

#[async_trait]
impl FixGenerator for CommandFixGenerator {
    async fn generate_fix(&self, context: &FixContext) -> visfix_common::Result<FixSuggestion> {
        self.suggest(context).await.map_err(|e| e.into_engine("fix generator"))
    }
}

fn validate(suggestion: &FixSuggestion) -> HarnessResult<()> {
    for (field, value) in [
        ("selector", &suggestion.selector),
        ("property", &suggestion.property),
        ("suggestedValue", &suggestion.suggested_value),
    ] {
        if value.trim().is_empty() {
            return Err(HarnessError::InvalidSuggestion(format!("{} is empty", field)));
        }
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use visfix_common::ArtifactRef;

    fn context() -> FixContext {
        FixContext {
            record_id: "c1".to_string(),
            page: "form".to_string(),
            diff_percentage: 3.0,
            threshold: 0.5,
            baseline_ref: ArtifactRef::new("baseline/form.png"),
            current_ref: ArtifactRef::new("current/form.png"),
            stylesheet: PathBuf::from("main.css"),
            stylesheet_text: ".btn-primary { background-color: red; }".to_string(),
            suspect: None,
        }
    }

    fn generator(script: &str) -> CommandFixGenerator {
        CommandFixGenerator::new(&["sh".to_string(), "-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_reads_suggestion_from_stdout() {
        let gen = generator(
            r##"grep -q '"recordId":"c1"' && echo '{"selector":".btn-primary","property":"background-color","suggestedValue":"#3498db"}'"##,
        );
        let suggestion = gen.generate_fix(&context()).await.unwrap();
        assert_eq!(suggestion.suggested_value, "#3498db");
        assert!(suggestion.rationale.is_empty());
    }

    #[tokio::test]
    async fn test_large_exchange_does_not_stall() {
        // Answers with more than a pipe buffer before reading its input
        let gen = generator(
            r#"r=$(head -c 200000 /dev/zero | tr '\0' a); printf '{"selector":".b","property":"color","suggestedValue":"red","rationale":"%s"}' "$r"; cat > /dev/null"#,
        );
        let mut ctx = context();
        ctx.stylesheet_text = ".b { color: blue; }\n".repeat(50_000);

        let suggestion = tokio::time::timeout(std::time::Duration::from_secs(20), gen.suggest(&ctx))
            .await
            .expect("generator exchange stalled")
            .unwrap();
        assert_eq!(suggestion.suggested_value, "red");
        assert_eq!(suggestion.rationale.len(), 200_000);
    }

    #[tokio::test]
    async fn test_garbage_output_is_external_failure() {
        let gen = generator("cat > /dev/null; echo 'not json'");
        let err = gen.generate_fix(&context()).await.unwrap_err();
        assert!(matches!(err, visfix_common::Error::ExternalService { .. }));
    }

    #[tokio::test]
    async fn test_empty_value_rejected() {
        let gen = generator(
            r#"cat > /dev/null; echo '{"selector":".a","property":"color","suggestedValue":" "}'"#,
        );
        let err = gen.suggest(&context()).await.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidSuggestion(_)));
    }
}
