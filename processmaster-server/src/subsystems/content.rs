//! Synchronous text operations: enhance, optimize, translate.
//!
//! Each call is recorded as an already-completed job row so usage shows up
//! next to queued work.

use std::time::Instant;

use processmaster_core::models::JobType;
use processmaster_core::VisionBackend;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::jobs::JobQueue;
use crate::error::{ApiError, ApiResult};

/// Stored input/output text is cut to this many characters.
const LOGGED_CHARS: usize = 1000;

fn logged(text: &str) -> String {
    text.chars().take(LOGGED_CHARS).collect()
}

fn require_content(content: Option<String>, what: &str) -> ApiResult<String> {
    content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ApiError::validation(format!("Content is required for {}", what)))
}

// ============================================================================
// Enhance
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhanceRequest {
    pub content: Option<String>,
    pub style: Option<String>,
    pub target_audience: Option<String>,
    pub improvements: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Enhanced {
    pub original_content: String,
    pub enhanced_content: String,
    pub improvements: serde_json::Value,
}

pub async fn enhance(
    vision: &dyn VisionBackend,
    jobs: &JobQueue,
    user_id: Uuid,
    req: EnhanceRequest,
) -> ApiResult<Enhanced> {
    let content = require_content(req.content, "enhancement")?;
    let style = req.style.unwrap_or_else(|| "professional".to_string());
    let audience = req.target_audience.unwrap_or_else(|| "general".to_string());
    let improvements = req.improvements.unwrap_or_else(|| {
        ["clarity", "completeness", "accuracy"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    });

    let started = Instant::now();
    let enhanced = vision.enhance_content(&content, &style).await?;
    let elapsed = started.elapsed().as_millis() as i64;

    jobs.record_completed(
        user_id,
        JobType::Enhance,
        serde_json::json!({
            "content": logged(&content),
            "style": style,
            "targetAudience": audience,
            "improvements": improvements,
        }),
        serde_json::json!({ "enhancedContent": logged(&enhanced) }),
        elapsed,
    )
    .await?;

    Ok(Enhanced {
        original_content: content,
        enhanced_content: enhanced,
        improvements: serde_json::json!({
            "style": style,
            "targetAudience": audience,
            "appliedImprovements": improvements,
        }),
    })
}

// ============================================================================
// Optimize
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeRequest {
    pub content: Option<String>,
    pub optimization_type: Option<String>,
    pub target_length: Option<u32>,
    pub keywords: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Optimized {
    pub original_content: String,
    pub optimized_content: String,
    pub optimization_type: String,
    pub improvements: LengthChange,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LengthChange {
    pub original_length: usize,
    pub optimized_length: usize,
    pub reduction_percentage: i64,
}

impl LengthChange {
    pub fn between(original: &str, optimized: &str) -> Self {
        let original_length = original.chars().count();
        let optimized_length = optimized.chars().count();
        let reduction_percentage = if original_length == 0 {
            0
        } else {
            ((1.0 - optimized_length as f64 / original_length as f64) * 100.0).round() as i64
        };
        Self {
            original_length,
            optimized_length,
            reduction_percentage,
        }
    }
}

/// Instruction passed to the model for each optimization type.
pub fn optimization_instruction(kind: &str, target_length: Option<u32>, keywords: Option<&[String]>) -> String {
    match kind {
        "readability" => {
            "Improve the readability and clarity of this content while maintaining its meaning."
                .to_string()
        }
        "seo" => {
            let keywords = match keywords {
                Some(k) if !k.is_empty() => k.join(", "),
                _ => "general keywords".to_string(),
            };
            format!("Optimize this content for SEO with keywords: {}", keywords)
        }
        "brevity" => match target_length {
            Some(n) => format!("Make this content more concise (target: {} words)", n),
            None => "Make this content more concise".to_string(),
        },
        _ => "Improve this content for better engagement and clarity.".to_string(),
    }
}

pub async fn optimize(
    vision: &dyn VisionBackend,
    jobs: &JobQueue,
    user_id: Uuid,
    req: OptimizeRequest,
) -> ApiResult<Optimized> {
    let content = require_content(req.content, "optimization")?;
    let kind = req
        .optimization_type
        .unwrap_or_else(|| "readability".to_string());
    let instruction = optimization_instruction(&kind, req.target_length, req.keywords.as_deref());

    let started = Instant::now();
    let optimized = vision.enhance_content(&content, &instruction).await?;
    let elapsed = started.elapsed().as_millis() as i64;

    jobs.record_completed(
        user_id,
        JobType::Enhance,
        serde_json::json!({ "content": logged(&content), "optimizationType": kind }),
        serde_json::json!({ "optimizedContent": logged(&optimized) }),
        elapsed,
    )
    .await?;

    Ok(Optimized {
        improvements: LengthChange::between(&content, &optimized),
        original_content: content,
        optimized_content: optimized,
        optimization_type: kind,
    })
}

// ============================================================================
// Translate
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateRequest {
    pub content: Option<String>,
    pub target_language: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Translated {
    pub original_content: String,
    pub translated_content: String,
    pub source_language: &'static str,
    pub target_language: String,
}

pub async fn translate(
    vision: &dyn VisionBackend,
    jobs: &JobQueue,
    user_id: Uuid,
    req: TranslateRequest,
) -> ApiResult<Translated> {
    let (Some(content), Some(target)) = (
        req.content.filter(|c| !c.trim().is_empty()),
        req.target_language.filter(|t| !t.trim().is_empty()),
    ) else {
        return Err(ApiError::validation("Content and target language are required"));
    };

    let started = Instant::now();
    let translated = vision.translate_content(&content, &target).await?;
    let elapsed = started.elapsed().as_millis() as i64;

    jobs.record_completed(
        user_id,
        JobType::Translate,
        serde_json::json!({ "content": logged(&content), "targetLanguage": target }),
        serde_json::json!({ "translatedContent": logged(&translated) }),
        elapsed,
    )
    .await?;

    Ok(Translated {
        original_content: content,
        translated_content: translated,
        source_language: "auto-detected",
        target_language: target,
    })
}
