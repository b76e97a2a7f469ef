//! Per-entry content processing: the subscription's transform programs, then
//! HTML sanitizing, then minifying.
//!
//! Each fetch worker owns its own [`ContentPipeline`].

use std::collections::HashSet;
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::LazyLock;

use ammonia::UrlRelative;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::fetcher::{FeedItem, FetchError};

pub const OUTPUT_PATH_ENV: &str = "FEEDPACK_OUTPUT_PATH";
pub const MAX_DOWNLOAD_ENV: &str = "FEEDPACK_MAX_DOWNLOAD";

static BETWEEN_TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r">\s+<").expect("between-tags regex should compile"));
static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{2,}").expect("whitespace regex should compile"));

/// Values exported to transform programs.
#[derive(Debug, Clone)]
pub struct PipelineEnv {
    pub output_path: String,
    pub max_download_kb: usize,
}

pub struct ContentPipeline {
    env: PipelineEnv,
    sanitizer: ammonia::Builder<'static>,
}

impl ContentPipeline {
    pub fn new(env: PipelineEnv) -> Self {
        let mut sanitizer = ammonia::Builder::default();
        sanitizer
            .url_schemes(HashSet::from(["http", "https", "mailto"]))
            .url_relative(UrlRelative::PassThrough);

        Self { env, sanitizer }
    }

    pub async fn process(&self, programs: &[String], item: &mut FeedItem) -> Result<(), FetchError> {
        for program in programs {
            self.run_program(program, item).await?;
        }
        self.sanitize(item);
        self.minify(item);
        Ok(())
    }

    /// Pipe the item through `/bin/sh -c program` as JSON.
    pub async fn run_program(&self, program: &str, item: &mut FeedItem) -> Result<(), FetchError> {
        let failed = |reason: String| FetchError::Program {
            program: program.to_string(),
            reason,
        };
        debug!("Running program \"{}\" on {}", program, item.guid);

        let input = serde_json::to_vec(item).map_err(|e| failed(e.to_string()))?;
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(program)
            .env(OUTPUT_PATH_ENV, &self.env.output_path)
            .env(MAX_DOWNLOAD_ENV, self.env.max_download_kb.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| failed("stdin unavailable".to_string()))?;
        let feed_input = async move {
            let written = stdin.write_all(&input).await;
            drop(stdin);
            written
        };
        let (written, output) = tokio::join!(feed_input, child.wait_with_output());

        let output = output.map_err(|e| failed(e.to_string()))?;
        if !output.status.success() {
            return Err(failed(format!("exited with {}", output.status)));
        }
        // Programs that do not read their input close the pipe early.
        if let Err(e) = written {
            if e.kind() != ErrorKind::BrokenPipe {
                return Err(failed(e.to_string()));
            }
        }

        let updated: FeedItem = serde_json::from_slice(&output.stdout)
            .map_err(|e| failed(format!("invalid JSON output: {e}")))?;
        if updated.guid != item.guid {
            return Err(FetchError::GuidChanged {
                program: program.to_string(),
            });
        }

        *item = updated;
        Ok(())
    }

    pub fn sanitize(&self, item: &mut FeedItem) {
        item.content = self.sanitizer.clean(&item.content).to_string();
    }

    pub fn minify(&self, item: &mut FeedItem) {
        let collapsed = BETWEEN_TAGS.replace_all(&item.content, "><");
        item.content = WHITESPACE_RUN.replace_all(&collapsed, " ").trim().to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> ContentPipeline {
        ContentPipeline::new(PipelineEnv {
            output_path: "/srv/packs".to_string(),
            max_download_kb: 123,
        })
    }

    fn item(content: &str) -> FeedItem {
        FeedItem {
            guid: "guid-1".to_string(),
            title: "Title".to_string(),
            content: content.to_string(),
            summary: String::new(),
            link: "https://example.com/1".to_string(),
            published: 1,
        }
    }

    mod sanitize_tests {
        use super::*;

        #[test]
        fn test_scripts_removed() {
            let mut i = item("<p>hi</p><script>alert(1)</script>");
            pipeline().sanitize(&mut i);
            assert_eq!(i.content, "<p>hi</p>");
        }

        #[test]
        fn test_javascript_urls_removed() {
            let mut i = item(r#"<a href="javascript:alert(1)">x</a>"#);
            pipeline().sanitize(&mut i);
            assert!(!i.content.contains("javascript"));
        }

        #[test]
        fn test_relative_links_kept() {
            let mut i = item(r#"<img src="/img/a.png">"#);
            pipeline().sanitize(&mut i);
            assert!(i.content.contains("/img/a.png"));
        }
    }

    mod minify_tests {
        use super::*;

        #[test]
        fn test_whitespace_between_tags_removed() {
            let mut i = item("<div>\n    <p>one   two</p>\n</div>\n");
            pipeline().minify(&mut i);
            assert_eq!(i.content, "<div><p>one two</p></div>");
        }
    }

    mod program_tests {
        use super::*;

        #[tokio::test]
        async fn test_identity_program() {
            let mut i = item("<p>body</p>");
            pipeline().run_program("cat", &mut i).await.unwrap();
            assert_eq!(i, item("<p>body</p>"));
        }

        #[tokio::test]
        async fn test_program_modifies_item() {
            let mut i = item("<p>body</p>");
            pipeline()
                .run_program(r#"sed 's/"title":"Title"/"title":"Changed"/'"#, &mut i)
                .await
                .unwrap();
            assert_eq!(i.title, "Changed");
        }

        #[tokio::test]
        async fn test_program_sees_environment() {
            let mut i = item("");
            pipeline()
                .run_program(
                    r#"cat > /dev/null; printf '{"guid":"guid-1","title":"%s","content":"%s","published":1}' "$FEEDPACK_OUTPUT_PATH" "$FEEDPACK_MAX_DOWNLOAD""#,
                    &mut i,
                )
                .await
                .unwrap();
            assert_eq!(i.title, "/srv/packs");
            assert_eq!(i.content, "123");
        }

        #[tokio::test]
        async fn test_failing_program_is_named() {
            let mut i = item("");
            let err = pipeline().run_program("exit 3", &mut i).await.unwrap_err();
            match err {
                FetchError::Program { program, .. } => assert_eq!(program, "exit 3"),
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        async fn test_invalid_output_rejected() {
            let mut i = item("");
            let err = pipeline()
                .run_program("cat > /dev/null; echo nope", &mut i)
                .await
                .unwrap_err();
            assert!(matches!(err, FetchError::Program { .. }));
        }

        #[tokio::test]
        async fn test_guid_change_rejected() {
            let mut i = item("");
            let err = pipeline()
                .run_program("sed 's/guid-1/guid-2/'", &mut i)
                .await
                .unwrap_err();
            assert!(matches!(err, FetchError::GuidChanged { .. }));
            assert_eq!(i.guid, "guid-1");
        }

        #[tokio::test]
        async fn test_process_runs_programs_in_order_then_cleans() {
            let programs = vec![
                r#"sed 's/"content":""/"content":"<p>a<\/p>   <script>x<\/script>"/'"#.to_string(),
                "cat".to_string(),
            ];
            let mut i = item("");
            pipeline().process(&programs, &mut i).await.unwrap();
            assert_eq!(i.content, "<p>a</p>");
        }
    }
}
