//! The built-in pipeline steps.
//!
//! Each stage reads its input from the previous stage's directory and
//! writes one artifact, so any step can be re-run in isolation. AI stages
//! whose prompt is not configured pass their input through unchanged.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use fetch_client::{FetchClient, HttpRequest};
use gemini_client::GeminiClient;
use inkwash_common::{ChannelConfig, PathSettings};
use wechat_client::{DraftArticle, UploadedMedia, WeChatClient};

use crate::pipeline::StepHandler;

const RAW_FILE: &str = "source.html";
const TRANSLATED_FILE: &str = "article.md";
const FORMATTED_FILE: &str = "article.html";
const TITLES_FILE: &str = "titles.txt";
const IMAGES_DIR: &str = "images";

/// Everything a step may need. Clients are optional so commands that never
/// reach a given stage (or dry runs) work without the matching credentials.
pub struct StepContext {
    pub channel: String,
    pub channel_config: ChannelConfig,
    pub paths: PathSettings,
    pub dry_run: bool,
    pub fetcher: Option<tokio::sync::Mutex<FetchClient>>,
    pub gemini: Option<GeminiClient>,
    pub wechat: Option<WeChatClient>,
}

impl StepContext {
    fn raw_path(&self) -> PathBuf {
        self.paths.raw_for(&self.channel).join(RAW_FILE)
    }

    fn translated_path(&self) -> PathBuf {
        self.paths.translated_for(&self.channel).join(TRANSLATED_FILE)
    }

    fn formatted_path(&self) -> PathBuf {
        self.paths.formatted_for(&self.channel).join(FORMATTED_FILE)
    }

    fn titles_path(&self) -> PathBuf {
        self.paths.titles_for(&self.channel).join(TITLES_FILE)
    }

    fn images_dir(&self) -> PathBuf {
        self.paths.channel_root(&self.channel).join(IMAGES_DIR)
    }

    fn gemini(&self) -> Result<&GeminiClient> {
        self.gemini
            .as_ref()
            .context("Gemini client not configured; set GEMINI_API_KEY")
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        let root = std::env::temp_dir().join("inkwash-step-tests");
        Self {
            channel: "test".to_string(),
            channel_config: ChannelConfig::default(),
            paths: PathSettings {
                data_dir: root.join("data"),
                state_dir: root.join("state"),
                cookie_jar: root.join("state/cookies.txt"),
                header_jar: root.join("state/headers.json"),
            },
            dry_run: true,
            fetcher: None,
            gemini: None,
            wechat: None,
        }
    }
}

fn write_artifact(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))
}

fn read_artifact(path: &Path, produced_by: &str) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| {
        format!(
            "missing artifact {}; run the '{produced_by}' step first",
            path.display()
        )
    })
}

// ---------------------------------------------------------------------------
// fetch
// ---------------------------------------------------------------------------

pub struct FetchStep;

#[async_trait]
impl StepHandler for FetchStep {
    async fn run(&self, ctx: &StepContext) -> Result<()> {
        if ctx.channel_config.source_url.is_empty() {
            bail!("channel '{}' has no source_url", ctx.channel);
        }
        let fetcher = ctx
            .fetcher
            .as_ref()
            .context("fetch client not initialized")?;
        let request = HttpRequest::get(&ctx.channel_config.source_url);
        let response = fetcher.lock().await.fetch(&request).await?;
        info!(
            channel = %ctx.channel,
            url = %response.url,
            status = response.status,
            bytes = response.body.len(),
            "Source fetched"
        );
        write_artifact(&ctx.raw_path(), &response.text)
    }
}

// ---------------------------------------------------------------------------
// translate / format / title
// ---------------------------------------------------------------------------

async fn prompted_rewrite(
    ctx: &StepContext,
    prompt: Option<&str>,
    input: &str,
    stage: &str,
) -> Result<String> {
    let Some(prompt) = prompt else {
        info!(channel = %ctx.channel, stage, "No prompt configured, passing input through");
        return Ok(input.to_string());
    };
    let full_prompt = format!("{prompt}\n\n{input}");
    ctx.gemini()?.generate(&full_prompt).await.map_err(Into::into)
}

pub struct TranslateStep;

#[async_trait]
impl StepHandler for TranslateStep {
    async fn run(&self, ctx: &StepContext) -> Result<()> {
        let raw = read_artifact(&ctx.raw_path(), "fetch")?;
        let translated = prompted_rewrite(
            ctx,
            ctx.channel_config.translate_prompt.as_deref(),
            &raw,
            "translate",
        )
        .await?;
        write_artifact(&ctx.translated_path(), &translated)
    }
}

pub struct FormatStep;

#[async_trait]
impl StepHandler for FormatStep {
    async fn run(&self, ctx: &StepContext) -> Result<()> {
        let translated = read_artifact(&ctx.translated_path(), "translate")?;
        let formatted = prompted_rewrite(
            ctx,
            ctx.channel_config.format_prompt.as_deref(),
            &translated,
            "format",
        )
        .await?;
        write_artifact(&ctx.formatted_path(), &formatted)
    }
}

pub struct TitleStep;

#[async_trait]
impl StepHandler for TitleStep {
    async fn run(&self, ctx: &StepContext) -> Result<()> {
        let translated = read_artifact(&ctx.translated_path(), "translate")?;
        let titles = match ctx.channel_config.title_prompt.as_deref() {
            Some(prompt) => {
                let full_prompt = format!("{prompt}\n\n{translated}");
                ctx.gemini()?.generate(&full_prompt).await?
            }
            // Without a prompt the first non-empty line stands in.
            None => translated
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or("Untitled")
                .to_string(),
        };
        write_artifact(&ctx.titles_path(), &titles)
    }
}

// ---------------------------------------------------------------------------
// publish
// ---------------------------------------------------------------------------

pub struct PublishStep;

#[async_trait]
impl StepHandler for PublishStep {
    async fn run(&self, ctx: &StepContext) -> Result<()> {
        let content = read_artifact(&ctx.formatted_path(), "format")?;
        let titles = read_artifact(&ctx.titles_path(), "title")?;
        let title = titles
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .context("titles artifact is empty")?;

        let images = channel_images(&ctx.images_dir())?;
        let referenced = referenced_image_indices(&content);

        if ctx.dry_run {
            info!(
                channel = %ctx.channel,
                title,
                content_chars = content.len(),
                images = images.len(),
                referenced_images = referenced.len(),
                "Dry run: draft not submitted"
            );
            return Ok(());
        }

        let wechat = ctx
            .wechat
            .as_ref()
            .context("WeChat client not configured; set WECHAT_APP_ID and WECHAT_APP_SECRET")?;

        // Upload every referenced image, substitute its hosted URL, and use
        // the first upload (or the first available image) as the cover.
        let mut uploads: Vec<(usize, UploadedMedia)> = Vec::new();
        let mut body = content.clone();
        for index in &referenced {
            let Some(path) = images.get(index - 1) else {
                bail!(
                    "content references {{{{IMAGE_{index}}}}} but only {} image(s) exist in {}",
                    images.len(),
                    ctx.images_dir().display()
                );
            };
            let media = wechat.upload_image(path).await?;
            body = body.replace(&format!("{{{{IMAGE_{index}}}}}"), &media.url);
            uploads.push((*index, media));
        }

        let thumb_media_id = match uploads.first() {
            Some((_, media)) => media.media_id.clone(),
            None => {
                let Some(first) = images.first() else {
                    bail!(
                        "channel '{}' has no images in {}; a cover image is required",
                        ctx.channel,
                        ctx.images_dir().display()
                    );
                };
                wechat.upload_image(first).await?.media_id
            }
        };

        let article = DraftArticle::new(title, body, thumb_media_id);
        let draft_id = wechat.create_draft(&[article]).await?;
        info!(channel = %ctx.channel, title, draft_id = %draft_id, "Draft published");
        Ok(())
    }
}

/// Channel images sorted by file name, so `{{IMAGE_1}}` is stable across
/// runs.
fn channel_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
    };
    let mut images: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    images.sort();
    Ok(images)
}

/// Distinct `{{IMAGE_n}}` indices in first-appearance order.
fn referenced_image_indices(content: &str) -> Vec<usize> {
    const OPEN: &str = "{{IMAGE_";
    let mut indices = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find(OPEN) {
        rest = &rest[start + OPEN.len()..];
        if let Some(end) = rest.find("}}") {
            if let Ok(index) = rest[..end].parse::<usize>() {
                if index >= 1 && !indices.contains(&index) {
                    indices.push(index);
                }
            } else {
                warn!(token = &rest[..end.min(32)], "Malformed image placeholder ignored");
            }
            rest = &rest[end + 2..];
        } else {
            break;
        }
    }
    indices
}
