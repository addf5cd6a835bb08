//! Guide export to HTML and Markdown.
//!
//! Rendering is pure; [`export_guide`] loads the guide, renders it and
//! optionally stores the document in the object store.

use std::time::Duration;

use chrono::Utc;
use processmaster_core::storage::{generate_key, SignedMethod, SignedUrl};
use processmaster_core::ObjectStore;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use super::guides::{fetch_guide, load_steps, resolve_access, GuideWithSteps};
use crate::error::{ApiError, ApiResult};

/// Lifetime of download links for uploaded exports.
pub const EXPORT_URL_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Html,
    Markdown,
}

impl ExportFormat {
    pub fn parse(raw: &str) -> ApiResult<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "html" => Ok(ExportFormat::Html),
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            other => Err(ApiError::BadRequest {
                code: "UNSUPPORTED_FORMAT",
                message: format!("Unsupported export format: {}", other),
            }),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Html => "html",
            ExportFormat::Markdown => "md",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Html => "text/html; charset=utf-8",
            ExportFormat::Markdown => "text/markdown; charset=utf-8",
        }
    }
}

/// Everything a renderer needs besides the guide itself.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    pub author: Option<String>,
    /// Screenshot URL per step, same order as the steps.
    pub screenshot_urls: Vec<Option<String>>,
}

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn render_html(doc: &GuideWithSteps, ctx: &RenderContext) -> String {
    let guide = &doc.guide;
    let mut html = String::new();

    html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"UTF-8\">\n");
    html.push_str(&format!("<title>{}</title>\n", escape_html(&guide.title)));
    html.push_str(
        "<style>body{font-family:sans-serif;max-width:800px;margin:0 auto;padding:20px;line-height:1.6}\
         .step{margin-bottom:2rem;padding:1rem;border:1px solid #e0e0e0;border-radius:8px}\
         .screenshot{max-width:100%;border:1px solid #ddd}</style>\n</head>\n<body>\n",
    );

    html.push_str(&format!("<h1>{}</h1>\n", escape_html(&guide.title)));
    if !guide.description.is_empty() {
        html.push_str(&format!("<p class=\"description\">{}</p>\n", escape_html(&guide.description)));
    }

    html.push_str("<ul class=\"metadata\">\n");
    if let Some(author) = &ctx.author {
        html.push_str(&format!("<li><strong>Author:</strong> {}</li>\n", escape_html(author)));
    }
    if let Some(difficulty) = &guide.difficulty {
        html.push_str(&format!("<li><strong>Difficulty:</strong> {}</li>\n", escape_html(difficulty)));
    }
    if let Some(time) = &guide.estimated_time {
        html.push_str(&format!("<li><strong>Estimated Time:</strong> {}</li>\n", escape_html(time)));
    }
    html.push_str(&format!(
        "<li><strong>Created:</strong> {}</li>\n",
        guide.created_at.format("%Y-%m-%d")
    ));
    if !guide.tags.is_empty() {
        let tags: Vec<String> = guide.tags.iter().map(|t| format!("#{}", escape_html(t))).collect();
        html.push_str(&format!("<li><strong>Tags:</strong> {}</li>\n", tags.join(" ")));
    }
    html.push_str("</ul>\n<h2>Steps</h2>\n");

    for (i, step) in doc.steps.iter().enumerate() {
        html.push_str("<div class=\"step\">\n");
        html.push_str(&format!(
            "<h3>Step {}: {}</h3>\n",
            step.step_number,
            escape_html(&step.title)
        ));
        if !step.description.is_empty() {
            html.push_str(&format!(
                "<p>{}</p>\n",
                escape_html(&step.description).replace('\n', "<br>")
            ));
        }
        if let Some(Some(url)) = ctx.screenshot_urls.get(i) {
            html.push_str(&format!(
                "<img class=\"screenshot\" src=\"{}\" alt=\"Step {} screenshot\">\n",
                escape_html(url),
                step.step_number
            ));
        }
        push_html_list(&mut html, "Tips", &step.tips);
        push_html_list(&mut html, "Important", &step.warnings);
        html.push_str("</div>\n");
    }

    html.push_str(&format!(
        "<footer>Generated by ProcessMaster Pro on {}</footer>\n</body>\n</html>\n",
        Utc::now().format("%Y-%m-%d")
    ));
    html
}

fn push_html_list(html: &mut String, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    html.push_str(&format!("<strong>{}:</strong>\n<ul>\n", heading));
    for item in items {
        html.push_str(&format!("<li>{}</li>\n", escape_html(item)));
    }
    html.push_str("</ul>\n");
}

pub fn render_markdown(doc: &GuideWithSteps, ctx: &RenderContext) -> String {
    let guide = &doc.guide;
    let mut md = format!("# {}\n\n", guide.title);

    if !guide.description.is_empty() {
        md.push_str(&format!("{}\n\n", guide.description));
    }
    if let Some(author) = &ctx.author {
        md.push_str(&format!("**Author:** {}\n\n", author));
    }
    if let Some(difficulty) = &guide.difficulty {
        md.push_str(&format!("**Difficulty:** {}\n\n", difficulty));
    }
    if let Some(time) = &guide.estimated_time {
        md.push_str(&format!("**Estimated Time:** {}\n\n", time));
    }
    if !guide.tags.is_empty() {
        let tags: Vec<String> = guide.tags.iter().map(|t| format!("`{}`", t)).collect();
        md.push_str(&format!("**Tags:** {}\n\n", tags.join(", ")));
    }

    md.push_str("## Steps\n\n");
    for (i, step) in doc.steps.iter().enumerate() {
        md.push_str(&format!("### Step {}: {}\n\n", step.step_number, step.title));
        if !step.description.is_empty() {
            md.push_str(&format!("{}\n\n", step.description));
        }
        if let Some(Some(url)) = ctx.screenshot_urls.get(i) {
            md.push_str(&format!("![Step {} screenshot]({})\n\n", step.step_number, url));
        }
        for tip in &step.tips {
            md.push_str(&format!("> Tip: {}\n", tip));
        }
        for warning in &step.warnings {
            md.push_str(&format!("> Warning: {}\n", warning));
        }
        if !step.tips.is_empty() || !step.warnings.is_empty() {
            md.push('\n');
        }
    }
    md
}

pub fn render(format: ExportFormat, doc: &GuideWithSteps, ctx: &RenderContext) -> String {
    match format {
        ExportFormat::Html => render_html(doc, ctx),
        ExportFormat::Markdown => render_markdown(doc, ctx),
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "delivery", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ExportOutcome {
    Inline {
        filename: String,
        content_type: &'static str,
        body: String,
    },
    Uploaded {
        key: String,
        filename: String,
        download: SignedUrl,
    },
}

async fn author_name(pool: &PgPool, user_id: Uuid) -> ApiResult<Option<String>> {
    let row: Option<(Option<String>, Option<String>, String)> =
        sqlx::query_as("SELECT first_name, last_name, email FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(first, last, email)| {
        let name = [first, last].into_iter().flatten().collect::<Vec<_>>().join(" ");
        if name.trim().is_empty() {
            email
        } else {
            name
        }
    }))
}

pub async fn export_guide(
    pool: &PgPool,
    store: &dyn ObjectStore,
    guide_id: Uuid,
    viewer: Uuid,
    format: ExportFormat,
    upload: bool,
) -> ApiResult<ExportOutcome> {
    resolve_access(pool, guide_id, viewer).await?;
    let guide = fetch_guide(pool, guide_id).await?;
    let steps = load_steps(pool, guide_id).await?;

    let screenshot_urls = steps
        .iter()
        .map(|s| {
            s.screenshot_key.as_deref().and_then(|key| {
                store
                    .presign(SignedMethod::Get, key, EXPORT_URL_TTL)
                    .map(|signed| signed.url)
                    .ok()
            })
        })
        .collect();
    let ctx = RenderContext {
        author: author_name(pool, guide.user_id).await?,
        screenshot_urls,
    };

    let doc = GuideWithSteps { guide, steps };
    let body = render(format, &doc, &ctx);
    let filename = format!("guide-{}.{}", guide_id, format.extension());

    if !upload {
        return Ok(ExportOutcome::Inline {
            filename,
            content_type: format.content_type(),
            body,
        });
    }

    let key = generate_key("exports", &filename, Utc::now());
    store.put(&key, body.as_bytes()).await?;
    let download = store.presign(SignedMethod::Get, &key, EXPORT_URL_TTL)?;
    tracing::info!(guide_id = %guide_id, key = %key, "Guide export stored");

    Ok(ExportOutcome::Uploaded {
        key,
        filename,
        download,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use processmaster_core::models::{Guide, GuideStatus, GuideStep, Visibility};

    fn doc() -> GuideWithSteps {
        let guide_id = Uuid::new_v4();
        let now = Utc::now();
        let step = |n: i32, title: &str| GuideStep {
            id: Uuid::new_v4(),
            guide_id,
            step_number: n,
            title: title.to_string(),
            description: format!("Do thing {}", n),
            action_type: Some("click".into()),
            element_description: None,
            screenshot_id: None,
            screenshot_key: None,
            coordinates: None,
            tips: if n == 1 { vec!["Look for the blue button".into()] } else { vec![] },
            warnings: vec![],
        };
        GuideWithSteps {
            guide: Guide {
                id: guide_id,
                user_id: Uuid::new_v4(),
                capture_session_id: None,
                title: "Submit <expenses> & claims".into(),
                description: "Monthly process".into(),
                content: serde_json::json!({}),
                tags: vec!["finance".into()],
                status: GuideStatus::Draft,
                visibility: Visibility::Private,
                difficulty: Some("beginner".into()),
                estimated_time: Some("60 seconds".into()),
                view_count: 0,
                like_count: 0,
                version: 1,
                created_at: now,
                updated_at: now,
                published_at: None,
            },
            steps: vec![step(1, "Open portal"), step(2, "Click \"Submit\"")],
        }
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(ExportFormat::parse("HTML").unwrap(), ExportFormat::Html);
        assert_eq!(ExportFormat::parse("md").unwrap(), ExportFormat::Markdown);
        let err = ExportFormat::parse("pdf").unwrap_err();
        assert_eq!(err.classify().1, "UNSUPPORTED_FORMAT");
    }

    #[test]
    fn test_html_escapes_user_text() {
        let html = render_html(&doc(), &RenderContext::default());
        assert!(html.contains("<title>Submit &lt;expenses&gt; &amp; claims</title>"));
        assert!(html.contains("Step 2: Click &quot;Submit&quot;"));
        assert!(!html.contains("<expenses>"));
        assert!(html.contains("<li>Look for the blue button</li>"));
    }

    #[test]
    fn test_markdown_orders_steps_and_embeds_screenshots() {
        let ctx = RenderContext {
            author: Some("Ada Lovelace".into()),
            screenshot_urls: vec![None, Some("http://store/s2.png".into())],
        };
        let md = render_markdown(&doc(), &ctx);
        let first = md.find("### Step 1: Open portal").unwrap();
        let second = md.find("### Step 2:").unwrap();
        assert!(first < second);
        assert!(md.contains("![Step 2 screenshot](http://store/s2.png)"));
        assert!(md.contains("**Author:** Ada Lovelace"));
        assert!(md.contains("> Tip: Look for the blue button"));
    }

    #[test]
    fn test_uploaded_key_layout() {
        let key = generate_key("exports", "guide-abc.html", Utc::now());
        assert!(key.starts_with("exports/"));
        assert!(key.ends_with("_guide-abc.html"));
    }
}
