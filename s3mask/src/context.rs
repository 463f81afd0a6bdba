//! The context resources a masking job installs on the masking service before it starts, and
//! removes again when it's done.
//!
//! Four resources are involved, and each one refers to the one before it by name, so they are
//! always created in this order:
//!
//! 1. `searchContext` with the matcher that finds sensitive data
//! 2. `maskContext` with the rule that says how matches are masked
//! 3. `files/fileSearchContext` applying the search context to files
//! 4. `files/fileMaskContext` applying the mask context to files
//!
//! Each mask request names the two file contexts.
use crate::masking::MaskingClient;
use crate::{Config, Result};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument};

const SEARCH_CONTEXT_NAME: &str = "SearchContext";
const MASK_CONTEXT_NAME: &str = "MaskContext";
const FILE_SEARCH_CONTEXT_NAME: &str = "FileSearchContext";
const FILE_MASK_CONTEXT_NAME: &str = "FileMaskContext";

const MATCHER_NAME: &str = "TestMatcher";
const RULE_NAME: &str = "TestRule";

/// One context resource to create on the masking service.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ContextResource {
    /// The resource path, relative to the masking service base URL
    pub resource: &'static str,

    /// The name the resource is created under, and destroyed by
    pub name: &'static str,

    pub definition: Value,
}

/// The `context` field of every mask request
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileContexts<'a> {
    file_search_context_name: &'a str,
    file_mask_context_name: &'a str,
}

/// The full set of context resources a masking job needs.
#[derive(Clone, Debug)]
pub(crate) struct ContextDefinitions {
    resources: Vec<ContextResource>,
}

impl ContextDefinitions {
    pub(crate) fn from_config(config: &Config) -> Self {
        let search_context = json!({
            "name": SEARCH_CONTEXT_NAME,
            "matchers": [
                {
                    "name": MATCHER_NAME,
                    "type": "pattern",
                    "pattern": config.search_pattern,
                }
            ]
        });

        let mask_context = json!({
            "name": MASK_CONTEXT_NAME,
            "rules": [
                {
                    "name": RULE_NAME,
                    "type": "cosort",
                    "expression": r"enc_fp_aes256_alphanum($\{NAME\})",
                }
            ],
            "ruleMatchers": [
                {
                    "name": "TestNameRuleMatcher",
                    "type": "name",
                    "rule": RULE_NAME,
                    "pattern": MATCHER_NAME,
                }
            ]
        });

        let mut file_search_context = json!({
            "name": FILE_SEARCH_CONTEXT_NAME,
            "matchers": [
                {
                    "name": SEARCH_CONTEXT_NAME,
                    "type": "searchContext",
                }
            ]
        });
        if let Some(buffer_limit) = config.buffer_limit {
            file_search_context["configs"] = json!({
                "text": {
                    "bufferLimit": buffer_limit,
                    "delimiter": "\n",
                }
            });
        }

        let file_mask_context = json!({
            "name": FILE_MASK_CONTEXT_NAME,
            "rules": [
                {
                    "name": MASK_CONTEXT_NAME,
                    "type": "maskContext",
                }
            ]
        });

        Self {
            resources: vec![
                ContextResource {
                    resource: "searchContext",
                    name: SEARCH_CONTEXT_NAME,
                    definition: search_context,
                },
                ContextResource {
                    resource: "maskContext",
                    name: MASK_CONTEXT_NAME,
                    definition: mask_context,
                },
                ContextResource {
                    resource: "files/fileSearchContext",
                    name: FILE_SEARCH_CONTEXT_NAME,
                    definition: file_search_context,
                },
                ContextResource {
                    resource: "files/fileMaskContext",
                    name: FILE_MASK_CONTEXT_NAME,
                    definition: file_mask_context,
                },
            ],
        }
    }

    pub(crate) fn resources(&self) -> &[ContextResource] {
        &self.resources
    }

    /// Create every context resource, in order.
    ///
    /// If any of them can't be created, the ones that were are destroyed again before the error
    /// is returned, so a failed setup leaves nothing behind.
    #[instrument(skip_all)]
    pub(crate) async fn establish(self, client: &MaskingClient) -> Result<EstablishedContext> {
        for (index, resource) in self.resources.iter().enumerate() {
            if let Err(e) = client
                .create_context(resource.resource, &resource.definition)
                .await
            {
                error!(err = ?e, resource = resource.resource, "Failed to create masking context resource");

                if index > 0 {
                    debug!(
                        created = index,
                        "Destroying the context resources created before the failure"
                    );
                    destroy_all(client, &self.resources[..index]).await;
                }

                return Err(e);
            }
        }

        let request_context = serde_json::to_string(&FileContexts {
            file_search_context_name: FILE_SEARCH_CONTEXT_NAME,
            file_mask_context_name: FILE_MASK_CONTEXT_NAME,
        })
        .expect("BUG: serializing string fields can't fail");

        info!("Masking context established");

        Ok(EstablishedContext {
            client: client.clone(),
            resources: self.resources,
            request_context,
        })
    }
}

/// Context resources that exist on the masking service and must be torn down.
#[derive(Debug)]
pub(crate) struct EstablishedContext {
    client: MaskingClient,
    resources: Vec<ContextResource>,
    request_context: String,
}

impl EstablishedContext {
    /// The JSON text to send as the `context` field of each mask request
    pub(crate) fn request_context(&self) -> &str {
        &self.request_context
    }

    /// Destroy every context resource.
    ///
    /// Failures are logged and don't stop the remaining resources from being destroyed.
    #[instrument(skip_all)]
    pub(crate) async fn teardown(self) {
        destroy_all(&self.client, &self.resources).await;

        info!("Masking context torn down");
    }
}

async fn destroy_all(client: &MaskingClient, resources: &[ContextResource]) {
    for resource in resources {
        if let Err(e) = client
            .destroy_context(resource.resource, resource.name)
            .await
        {
            error!(err = ?e, resource = resource.resource, name = resource.name,
                "Failed to destroy masking context resource; it may have to be removed by hand");
        }
    }
}
