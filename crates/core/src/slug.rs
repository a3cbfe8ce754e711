//! Slug allocation
//!
//! After the first user message of a conversation, an LLM proposes a
//! short kebab-case label which is persisted as the conversation's
//! unique slug. Conflicts are absorbed by numeric suffixes; model
//! selection walks a tag-based fallback chain so slug generation keeps
//! working when the preferred cheap model is down.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, Result};
use crate::llm::{self, Content, LlmProvider, LlmService, PREDICTABLE_MODEL_ID};
use crate::store::ConversationStore;

/// Timeout for the slug LLM call.
const SLUG_LLM_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum slug length after sanitization.
const MAX_SLUG_LEN: usize = 60;

/// How many numeric suffixes to try on unique-constraint conflicts.
const MAX_SUFFIX_ATTEMPTS: usize = 100;

/// Clean a string into a valid slug: lowercase, hyphen-separated,
/// `[a-z0-9-]` only, at most 60 characters. Idempotent.
pub fn sanitize(input: &str) -> String {
    static SEPARATORS: OnceLock<Regex> = OnceLock::new();
    static INVALID: OnceLock<Regex> = OnceLock::new();
    static HYPHEN_RUNS: OnceLock<Regex> = OnceLock::new();

    let separators = SEPARATORS.get_or_init(|| Regex::new(r"[\s_]+").unwrap());
    let invalid = INVALID.get_or_init(|| Regex::new(r"[^a-z0-9-]+").unwrap());
    let hyphen_runs = HYPHEN_RUNS.get_or_init(|| Regex::new(r"-+").unwrap());

    let slug = input.to_lowercase();
    let slug = separators.replace_all(&slug, "-");
    let slug = invalid.replace_all(&slug, "");
    let slug = hyphen_runs.replace_all(&slug, "-");
    let slug = slug.trim_matches('-');

    if slug.len() > MAX_SLUG_LEN {
        let mut end = MAX_SLUG_LEN;
        while !slug.is_char_boundary(end) {
            end -= 1;
        }
        slug[..end].trim_matches('-').to_string()
    } else {
        slug.to_string()
    }
}

/// Generate a slug for a conversation and persist it, retrying with
/// numeric suffixes on conflicts. Returns the assigned slug.
pub async fn generate_slug(
    provider: &dyn LlmProvider,
    store: &dyn ConversationStore,
    conversation_id: &str,
    user_message: &str,
    conversation_model_id: &str,
) -> Result<String> {
    let base = generate_slug_text(provider, user_message, conversation_model_id).await?;

    let mut slug = base.clone();
    for attempt in 0..MAX_SUFFIX_ATTEMPTS {
        match store.update_slug(conversation_id, &slug).await {
            Ok(_) => {
                tracing::info!(conversation_id, slug = %slug, "generated slug for conversation");
                return Ok(slug);
            }
            Err(CoreError::SlugConflict(_)) => {
                slug = format!("{base}-{}", attempt + 1);
            }
            Err(e) => return Err(e),
        }
    }

    Err(CoreError::Slug(format!(
        "failed to generate unique slug after {MAX_SUFFIX_ATTEMPTS} attempts"
    )))
}

/// Produce a sanitized slug candidate from the user message.
///
/// Model priority:
/// 1. the deterministic testing model, when the conversation uses it;
/// 2. models tagged `slug`, then `slug-backup` (generation failures fall
///    through to the next model);
/// 3. the conversation's own model;
/// 4. give up.
async fn generate_slug_text(
    provider: &dyn LlmProvider,
    user_message: &str,
    conversation_model_id: &str,
) -> Result<String> {
    if conversation_model_id == PREDICTABLE_MODEL_ID {
        match provider.get_service(PREDICTABLE_MODEL_ID) {
            Ok(service) => return call_slug_llm(service.as_ref(), user_message).await,
            Err(e) => {
                tracing::debug!(error = %e, "predictable model not available for slug generation");
            }
        }
    }

    for tag in ["slug", "slug-backup"] {
        for model_id in provider.available_models() {
            let Some(info) = provider.model_info(&model_id) else {
                continue;
            };
            if !has_tag(&info.tags, tag) {
                continue;
            }
            let service = match provider.get_service(&model_id) {
                Ok(service) => service,
                Err(e) => {
                    tracing::debug!(model = %model_id, tag, error = %e, "failed to get model for slug generation");
                    continue;
                }
            };
            tracing::debug!(model = %model_id, tag, "trying model for slug generation");
            match call_slug_llm(service.as_ref(), user_message).await {
                Ok(slug) => return Ok(slug),
                Err(e) => {
                    tracing::warn!(model = %model_id, tag, error = %e, "slug generation failed, trying next model");
                }
            }
        }
    }

    if !conversation_model_id.is_empty() && conversation_model_id != PREDICTABLE_MODEL_ID {
        match provider.get_service(conversation_model_id) {
            Ok(service) => {
                tracing::debug!(model = conversation_model_id, "using conversation model for slug generation");
                return call_slug_llm(service.as_ref(), user_message).await;
            }
            Err(e) => {
                tracing::debug!(model = conversation_model_id, error = %e, "conversation model not available for slug generation");
            }
        }
    }

    Err(CoreError::Slug(
        "no suitable model available for slug generation".to_string(),
    ))
}

/// Check whether a comma-separated tag list contains the exact tag.
fn has_tag(tags: &str, tag: &str) -> bool {
    tags.split(',').any(|t| t.trim() == tag)
}

async fn call_slug_llm(service: &dyn LlmService, user_message: &str) -> Result<String> {
    let prompt = format!(
        "Generate a short, descriptive slug (2-6 words, lowercase, hyphen-separated) \
for a conversation that starts with this user message:

{user_message}

The slug should:
- Be concise and descriptive
- Use only lowercase letters, numbers, and hyphens
- Capture the main topic or intent
- Be suitable as a filename or URL path

Respond with only the slug, nothing else."
    );

    let request = llm::Request {
        messages: vec![llm::Message::user(prompt)],
        ..Default::default()
    };

    let cancel = CancellationToken::new();
    let response = match tokio::time::timeout(SLUG_LLM_TIMEOUT, service.complete(&cancel, request))
        .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return Err(CoreError::Slug(format!("failed to generate slug: {e}"))),
        Err(_) => {
            cancel.cancel();
            return Err(CoreError::Slug("slug generation timed out".to_string()));
        }
    };

    // First non-empty text content block; thinking blocks are skipped.
    let raw = response
        .message
        .content
        .iter()
        .find_map(|c| match c {
            Content::Text { text } if !text.is_empty() => Some(text.clone()),
            _ => None,
        })
        .ok_or_else(|| CoreError::Slug("no text content in LLM response".to_string()))?;

    let slug = sanitize(raw.trim());
    if slug.is_empty() {
        return Err(CoreError::Slug(
            "generated slug is empty after sanitization".to_string(),
        ));
    }
    Ok(slug)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Message, ModelRegistry, PredictableService, Response, Role, Usage};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[test]
    fn sanitize_table() {
        let cases = [
            ("Simple Test", "simple-test"),
            ("Create a Python Script", "create-a-python-script"),
            ("Multiple   Spaces", "multiple-spaces"),
            ("Special@#$%Characters", "specialcharacters"),
            ("Under_Score_Test", "under-score-test"),
            ("--multiple-hyphens--", "multiple-hyphens"),
            ("CamelCase Example", "camelcase-example"),
            ("123 Numbers Test 456", "123-numbers-test-456"),
            ("   leading and trailing   ", "leading-and-trailing"),
            ("", ""),
            ("@#$%^&*()", ""),
            (
                "Very Long Slug That Might Need To Be Truncated Because It Is Too Long For Normal Use",
                "very-long-slug-that-might-need-to-be-truncated-because-it-is",
            ),
        ];
        for (input, expected) in cases {
            assert_eq!(sanitize(input), expected, "input: {input:?}");
        }
    }

    #[test]
    fn sanitize_is_idempotent() {
        let inputs = [
            "Simple Test",
            "--multiple-hyphens--",
            "@#$%^&*()",
            "   leading and trailing   ",
            "Very Long Slug That Might Need To Be Truncated Because It Is Too Long For Normal Use",
        ];
        for input in inputs {
            let once = sanitize(input);
            assert_eq!(sanitize(&once), once, "input: {input:?}");
        }
    }

    #[test]
    fn tag_list_is_comma_separated_exact_match() {
        assert!(has_tag("slug", "slug"));
        assert!(has_tag("cheap, slug ,fast", "slug"));
        assert!(!has_tag("slug-backup", "slug"));
        assert!(!has_tag("", "slug"));
    }

    fn predictable_provider(slug_texts: &[&str]) -> Arc<ModelRegistry> {
        let provider = Arc::new(ModelRegistry::new());
        let service = Arc::new(PredictableService::new());
        for text in slug_texts {
            service.push_text(*text);
        }
        provider.register(PREDICTABLE_MODEL_ID, "", service);
        provider
    }

    #[tokio::test]
    async fn conflict_cascade_assigns_numeric_suffixes() {
        let store = MemoryStore::new();
        let provider = predictable_provider(&["test-slug", "test-slug", "test-slug"]);

        let mut assigned = Vec::new();
        for _ in 0..3 {
            let conv = store.create_conversation(None, None).await.unwrap();
            let slug = generate_slug(
                provider.as_ref(),
                &store,
                &conv.conversation_id,
                "force the same slug",
                PREDICTABLE_MODEL_ID,
            )
            .await
            .unwrap();
            assigned.push(slug);
        }

        assert_eq!(assigned, vec!["test-slug", "test-slug-1", "test-slug-2"]);
    }

    #[tokio::test]
    async fn empty_after_sanitize_is_reported() {
        let store = MemoryStore::new();
        let conv = store.create_conversation(None, None).await.unwrap();
        let provider = predictable_provider(&["@#$%^&*()"]);

        let err = generate_slug(
            provider.as_ref(),
            &store,
            &conv.conversation_id,
            "anything",
            PREDICTABLE_MODEL_ID,
        )
        .await
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "generated slug is empty after sanitization"
        );
    }

    #[tokio::test]
    async fn thinking_blocks_are_skipped_for_candidate_text() {
        let store = MemoryStore::new();
        let conv = store.create_conversation(None, None).await.unwrap();

        let service = Arc::new(PredictableService::new());
        service.push_response(Response {
            message: Message {
                role: Role::Assistant,
                content: vec![
                    Content::Thinking {
                        thinking: "the user wants a slug".to_string(),
                    },
                    Content::Text {
                        text: "Deploy Helper".to_string(),
                    },
                ],
                end_of_turn: true,
            },
            usage: Usage::default(),
        });
        let provider = Arc::new(ModelRegistry::new());
        provider.register(PREDICTABLE_MODEL_ID, "", service);

        let slug = generate_slug(
            provider.as_ref(),
            &store,
            &conv.conversation_id,
            "help me deploy",
            PREDICTABLE_MODEL_ID,
        )
        .await
        .unwrap();
        assert_eq!(slug, "deploy-helper");
    }

    #[tokio::test]
    async fn falls_back_from_slug_tag_to_backup_then_conversation_model() {
        struct FailingService;

        #[async_trait::async_trait]
        impl LlmService for FailingService {
            async fn complete(
                &self,
                _cancel: &CancellationToken,
                _request: llm::Request,
            ) -> anyhow::Result<Response> {
                anyhow::bail!("model down")
            }
        }

        let store = MemoryStore::new();
        let conv = store.create_conversation(None, None).await.unwrap();

        // The slug-tagged model fails; the backup-tagged one answers.
        let backup = Arc::new(PredictableService::new());
        backup.push_text("from-backup");
        let provider = Arc::new(ModelRegistry::new());
        provider.register("primary", "slug", Arc::new(FailingService));
        provider.register("backup", "slug-backup", backup);

        let slug = generate_slug(
            provider.as_ref(),
            &store,
            &conv.conversation_id,
            "hello",
            "primary",
        )
        .await
        .unwrap();
        assert_eq!(slug, "from-backup");

        // No tagged models at all: the conversation's own model serves.
        let own = Arc::new(PredictableService::new());
        own.push_text("own-model-slug");
        let provider = Arc::new(ModelRegistry::new());
        provider.register("mine", "", own);
        let conv2 = store.create_conversation(None, None).await.unwrap();
        let slug = generate_slug(
            provider.as_ref(),
            &store,
            &conv2.conversation_id,
            "hello",
            "mine",
        )
        .await
        .unwrap();
        assert_eq!(slug, "own-model-slug");

        // Nothing available anywhere.
        let empty = Arc::new(ModelRegistry::new());
        let conv3 = store.create_conversation(None, None).await.unwrap();
        let err = generate_slug(
            empty.as_ref(),
            &store,
            &conv3.conversation_id,
            "hello",
            "absent",
        )
        .await
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("no suitable model available for slug generation"));
    }
}
