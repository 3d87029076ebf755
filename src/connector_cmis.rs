//! CMIS connectors: generic CMIS 1.1 repositories and Alfresco.
//!
//! Uses the CMIS browser binding (JSON over HTTP) with basic auth: list the
//! children of the configured folder path, then download each document's
//! content stream. Alfresco differs only in where the browser binding root
//! lives (`/alfresco/api/-default-/public/cmis/versions/1.1/browser`).
//!
//! Modification timestamps (`cmis:lastModificationDate`, epoch millis)
//! double as sync ordinals for the change feed.

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::connector::{
    classify_source_status, ext_of, ConnectorProgress, DocumentStream, ProgressFn, SourceConnector,
};
use crate::error::EngineError;
use crate::models::{ChangeEvent, ChangeKind, Document, SourceSpec};

/// One document listed from the repository.
#[derive(Debug, Clone)]
struct CmisEntry {
    object_id: String,
    name: String,
    modified_at: DateTime<Utc>,
}

pub struct CmisConnector {
    spec: SourceSpec,
    client: reqwest::Client,
}

impl CmisConnector {
    pub fn new(spec: SourceSpec) -> Self {
        Self {
            spec,
            client: reqwest::Client::new(),
        }
    }

    fn parts(&self) -> (&str, &str, &str, &str) {
        match &self.spec {
            SourceSpec::Cmis {
                base_url,
                folder_path,
                username,
                password,
            }
            | SourceSpec::Alfresco {
                base_url,
                folder_path,
                username,
                password,
            } => (base_url, folder_path, username, password),
            other => unreachable!("CmisConnector dispatched for {}", other.family()),
        }
    }

    /// Browser binding root for the repository.
    fn browser_root(&self) -> String {
        let (base_url, _, _, _) = self.parts();
        let base = base_url.trim_end_matches('/');
        match &self.spec {
            SourceSpec::Alfresco { .. } => {
                format!("{base}/api/-default-/public/cmis/versions/1.1/browser")
            }
            _ => base.to_string(),
        }
    }

    fn basic_auth(&self) -> String {
        let (_, _, username, password) = self.parts();
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
        format!("Basic {encoded}")
    }

    async fn get(&self, url: &str, context: &str) -> Result<reqwest::Response, EngineError> {
        let resp = self
            .client
            .get(url)
            .header("Authorization", self.basic_auth())
            .send()
            .await
            .map_err(|e| EngineError::source_transient(format!("{context}: {e}")))?;
        if !resp.status().is_success() {
            return Err(classify_source_status(resp.status(), context));
        }
        Ok(resp)
    }

    async fn list(&self) -> Result<Vec<CmisEntry>, EngineError> {
        let (_, folder_path, _, _) = self.parts();
        let root = self.browser_root();
        let path = folder_path.trim_matches('/');
        let url = format!("{root}/root/{path}?cmisselector=children&succinct=true");

        let json: Value = self
            .get(&url, "cmis list")
            .await?
            .json()
            .await
            .map_err(|e| EngineError::source_permanent(format!("cmis list: {e}")))?;

        let mut entries = Vec::new();
        if let Some(objects) = json["objects"].as_array() {
            for object in objects {
                let props = &object["object"]["succinctProperties"];
                if props["cmis:baseTypeId"].as_str() != Some("cmis:document") {
                    continue;
                }
                let modified_at = props["cmis:lastModificationDate"]
                    .as_i64()
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .unwrap_or_else(Utc::now);
                entries.push(CmisEntry {
                    object_id: props["cmis:objectId"].as_str().unwrap_or_default().to_string(),
                    name: props["cmis:name"].as_str().unwrap_or_default().to_string(),
                    modified_at,
                });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn download(&self, entry: &CmisEntry) -> Result<Vec<u8>, EngineError> {
        let root = self.browser_root();
        let url = format!(
            "{root}/root?cmisselector=content&objectId={}",
            entry.object_id
        );
        self.get(&url, &entry.name)
            .await?
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| EngineError::source_transient(format!("{}: {e}", entry.name)))
    }
}

#[async_trait]
impl SourceConnector for CmisConnector {
    fn kind(&self) -> &'static str {
        self.spec.family()
    }

    async fn enumerate(
        &self,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<(usize, DocumentStream), EngineError> {
        let entries = self.list().await?;
        let total = entries.len();
        progress(ConnectorProgress::SetTotal(total));

        let connector = CmisConnector::new(self.spec.clone());
        let family = self.kind();
        let stream = async_stream::stream! {
            for entry in entries {
                if cancel.is_cancelled() {
                    return;
                }
                match connector.download(&entry).await {
                    Ok(bytes) => {
                        progress(ConnectorProgress::Fetched {
                            logical_path: entry.name.clone(),
                        });
                        let mut doc = Document::from_bytes(
                            format!("{family}:{}", entry.object_id),
                            entry.name.clone(),
                            entry.name.clone(),
                            ext_of(&entry.name),
                            bytes,
                        );
                        doc.metadata
                            .insert("modified_at".to_string(), entry.modified_at.to_rfc3339());
                        yield Ok(doc);
                    }
                    Err(e) => {
                        warn!(file = %entry.name, error = %e, "cmis download failed");
                        yield Err(e);
                    }
                }
            }
        };

        Ok((total, Box::pin(stream)))
    }

    async fn fetch_changes(&self, since_ordinal: i64) -> Result<Vec<ChangeEvent>, EngineError> {
        let entries = self.list().await?;
        let family = self.kind();
        Ok(entries
            .into_iter()
            .map(|entry| {
                let ordinal = entry.modified_at.timestamp_micros();
                ChangeEvent {
                    change: if ordinal > since_ordinal {
                        ChangeKind::Modify
                    } else {
                        ChangeKind::Add
                    },
                    source_path: entry.name,
                    source_id: Some(format!("{family}:{}", entry.object_id)),
                    modified_at: entry.modified_at,
                    ordinal,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alfresco_spec() -> SourceSpec {
        SourceSpec::Alfresco {
            base_url: "https://alfresco.example.com/alfresco".to_string(),
            folder_path: "/Sites/docs/documentLibrary".to_string(),
            username: "admin".to_string(),
            password: "admin".to_string(),
        }
    }

    #[test]
    fn alfresco_browser_root_is_derived() {
        let connector = CmisConnector::new(alfresco_spec());
        assert_eq!(
            connector.browser_root(),
            "https://alfresco.example.com/alfresco/api/-default-/public/cmis/versions/1.1/browser"
        );
        assert_eq!(connector.kind(), "alfresco");
    }

    #[test]
    fn generic_cmis_uses_base_url_directly() {
        let connector = CmisConnector::new(SourceSpec::Cmis {
            base_url: "https://dms.example.com/cmis/browser/".to_string(),
            folder_path: "docs".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
        });
        assert_eq!(connector.browser_root(), "https://dms.example.com/cmis/browser");
        assert_eq!(connector.kind(), "cmis");
    }

    #[test]
    fn basic_auth_header_is_encoded() {
        let connector = CmisConnector::new(alfresco_spec());
        assert_eq!(connector.basic_auth(), "Basic YWRtaW46YWRtaW4=");
    }
}
