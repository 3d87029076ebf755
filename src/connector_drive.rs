//! Drive-API connectors: OneDrive, SharePoint, Google Drive, Box.
//!
//! All four families expose folder listings over authenticated REST and a
//! per-file content download; the connector walks the configured folder's
//! direct children. Credential acquisition (OAuth flows, service accounts)
//! is out of scope — the spec carries a pre-acquired bearer token.
//!
//! | Family | Listing endpoint | Download |
//! |--------|-----------------|----------|
//! | `onedrive` | Graph `/drives/{id}/.../children` | `/items/{id}/content` |
//! | `sharepoint` | Graph `/sites/{site}/drives/{id}/.../children` | `/items/{id}/content` |
//! | `gdrive` | Drive v3 `files?q='{folder}' in parents` | `files/{id}?alt=media` |
//! | `box` | `/2.0/folders/{id}/items` | `/2.0/files/{id}/content` |
//!
//! Modification timestamps double as sync ordinals for the change feed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::connector::{
    classify_source_status, ext_of, ConnectorProgress, DocumentStream, ProgressFn, SourceConnector,
};
use crate::error::EngineError;
use crate::models::{ChangeEvent, ChangeKind, Document, SourceSpec};

const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";
const GDRIVE_BASE: &str = "https://www.googleapis.com/drive/v3";
const BOX_BASE: &str = "https://api.box.com/2.0";

/// One file entry listed from a drive.
#[derive(Debug, Clone)]
struct DriveEntry {
    id: String,
    name: String,
    modified_at: DateTime<Utc>,
}

pub struct DriveConnector {
    spec: SourceSpec,
    client: reqwest::Client,
}

impl DriveConnector {
    pub fn new(spec: SourceSpec) -> Self {
        Self {
            spec,
            client: reqwest::Client::new(),
        }
    }

    fn token(&self) -> &str {
        match &self.spec {
            SourceSpec::Onedrive { access_token, .. }
            | SourceSpec::Sharepoint { access_token, .. }
            | SourceSpec::Gdrive { access_token, .. }
            | SourceSpec::Box { access_token, .. } => access_token,
            other => unreachable!("DriveConnector dispatched for {}", other.family()),
        }
    }

    async fn get_json(&self, url: &str, context: &str) -> Result<Value, EngineError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(self.token())
            .send()
            .await
            .map_err(|e| EngineError::source_transient(format!("{context}: {e}")))?;
        if !resp.status().is_success() {
            return Err(classify_source_status(resp.status(), context));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| EngineError::source_permanent(format!("{context}: {e}")))
    }

    async fn get_bytes(&self, url: &str, context: &str) -> Result<Vec<u8>, EngineError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(self.token())
            .send()
            .await
            .map_err(|e| EngineError::source_transient(format!("{context}: {e}")))?;
        if !resp.status().is_success() {
            return Err(classify_source_status(resp.status(), context));
        }
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| EngineError::source_transient(format!("{context}: {e}")))
    }

    /// Microsoft Graph children URL for a drive root or folder path.
    fn graph_children_url(&self) -> String {
        let (prefix, folder_path) = match &self.spec {
            SourceSpec::Onedrive { drive_id, folder_path, .. } => {
                (format!("{GRAPH_BASE}/drives/{drive_id}"), folder_path)
            }
            SourceSpec::Sharepoint { site_id, drive_id, folder_path, .. } => (
                format!("{GRAPH_BASE}/sites/{site_id}/drives/{drive_id}"),
                folder_path,
            ),
            other => unreachable!("graph url for {}", other.family()),
        };
        if folder_path.is_empty() {
            format!("{prefix}/root/children")
        } else {
            format!("{prefix}/root:/{}:/children", folder_path.trim_matches('/'))
        }
    }

    async fn list(&self) -> Result<Vec<DriveEntry>, EngineError> {
        let mut entries = match &self.spec {
            SourceSpec::Onedrive { .. } | SourceSpec::Sharepoint { .. } => {
                self.list_graph().await?
            }
            SourceSpec::Gdrive { .. } => self.list_gdrive().await?,
            SourceSpec::Box { .. } => self.list_box().await?,
            other => unreachable!("DriveConnector dispatched for {}", other.family()),
        };
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn list_graph(&self) -> Result<Vec<DriveEntry>, EngineError> {
        let mut entries = Vec::new();
        let mut url = self.graph_children_url();
        loop {
            let json = self.get_json(&url, "graph list").await?;
            if let Some(items) = json["value"].as_array() {
                for item in items {
                    // Folders carry a "folder" facet; only files are listed.
                    if item.get("file").is_none() {
                        continue;
                    }
                    entries.push(DriveEntry {
                        id: item["id"].as_str().unwrap_or_default().to_string(),
                        name: item["name"].as_str().unwrap_or_default().to_string(),
                        modified_at: parse_time(item["lastModifiedDateTime"].as_str()),
                    });
                }
            }
            match json["@odata.nextLink"].as_str() {
                Some(next) => url = next.to_string(),
                None => break,
            }
        }
        Ok(entries)
    }

    async fn list_gdrive(&self) -> Result<Vec<DriveEntry>, EngineError> {
        let SourceSpec::Gdrive { folder_id, .. } = &self.spec else {
            unreachable!()
        };
        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!(
                "{GDRIVE_BASE}/files?q='{folder_id}'+in+parents+and+trashed=false\
                 &fields=nextPageToken,files(id,name,mimeType,modifiedTime)"
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={token}"));
            }
            let json = self.get_json(&url, "gdrive list").await?;
            if let Some(files) = json["files"].as_array() {
                for file in files {
                    if file["mimeType"].as_str() == Some("application/vnd.google-apps.folder") {
                        continue;
                    }
                    entries.push(DriveEntry {
                        id: file["id"].as_str().unwrap_or_default().to_string(),
                        name: file["name"].as_str().unwrap_or_default().to_string(),
                        modified_at: parse_time(file["modifiedTime"].as_str()),
                    });
                }
            }
            match json["nextPageToken"].as_str() {
                Some(token) => page_token = Some(token.to_string()),
                None => break,
            }
        }
        Ok(entries)
    }

    async fn list_box(&self) -> Result<Vec<DriveEntry>, EngineError> {
        let SourceSpec::Box { folder_id, .. } = &self.spec else {
            unreachable!()
        };
        let mut entries = Vec::new();
        let mut offset = 0usize;
        loop {
            let url = format!(
                "{BOX_BASE}/folders/{folder_id}/items?fields=id,name,type,modified_at&limit=1000&offset={offset}"
            );
            let json = self.get_json(&url, "box list").await?;
            let items = json["entries"].as_array().cloned().unwrap_or_default();
            for item in &items {
                if item["type"].as_str() != Some("file") {
                    continue;
                }
                entries.push(DriveEntry {
                    id: item["id"].as_str().unwrap_or_default().to_string(),
                    name: item["name"].as_str().unwrap_or_default().to_string(),
                    modified_at: parse_time(item["modified_at"].as_str()),
                });
            }
            let total = json["total_count"].as_u64().unwrap_or(0) as usize;
            offset += items.len();
            if offset >= total || items.is_empty() {
                break;
            }
        }
        Ok(entries)
    }

    async fn download(&self, entry: &DriveEntry) -> Result<Vec<u8>, EngineError> {
        let url = match &self.spec {
            SourceSpec::Onedrive { drive_id, .. } => {
                format!("{GRAPH_BASE}/drives/{drive_id}/items/{}/content", entry.id)
            }
            SourceSpec::Sharepoint { site_id, drive_id, .. } => format!(
                "{GRAPH_BASE}/sites/{site_id}/drives/{drive_id}/items/{}/content",
                entry.id
            ),
            SourceSpec::Gdrive { .. } => {
                format!("{GDRIVE_BASE}/files/{}?alt=media", entry.id)
            }
            SourceSpec::Box { .. } => format!("{BOX_BASE}/files/{}/content", entry.id),
            other => unreachable!("DriveConnector dispatched for {}", other.family()),
        };
        self.get_bytes(&url, &entry.name).await
    }
}

#[async_trait]
impl SourceConnector for DriveConnector {
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

        let connector = DriveConnector::new(self.spec.clone());
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
                            format!("{family}:{}", entry.id),
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
                        warn!(file = %entry.name, error = %e, "drive download failed");
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
                    source_id: Some(format!("{family}:{}", entry.id)),
                    modified_at: entry.modified_at,
                    ordinal,
                }
            })
            .collect())
    }
}

fn parse_time(value: Option<&str>) -> DateTime<Utc> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn onedrive_spec(folder: &str) -> SourceSpec {
        SourceSpec::Onedrive {
            drive_id: "d1".to_string(),
            folder_path: folder.to_string(),
            access_token: "token".to_string(),
        }
    }

    #[test]
    fn graph_url_for_root_and_folder() {
        let connector = DriveConnector::new(onedrive_spec(""));
        assert_eq!(
            connector.graph_children_url(),
            "https://graph.microsoft.com/v1.0/drives/d1/root/children"
        );

        let connector = DriveConnector::new(onedrive_spec("/docs/reports/"));
        assert_eq!(
            connector.graph_children_url(),
            "https://graph.microsoft.com/v1.0/drives/d1/root:/docs/reports:/children"
        );
    }

    #[test]
    fn sharepoint_urls_include_the_site() {
        let connector = DriveConnector::new(SourceSpec::Sharepoint {
            site_id: "s1".to_string(),
            drive_id: "d1".to_string(),
            folder_path: String::new(),
            access_token: "token".to_string(),
        });
        assert!(connector.graph_children_url().contains("/sites/s1/drives/d1/"));
        assert_eq!(connector.kind(), "sharepoint");
    }

    #[test]
    fn timestamps_fall_back_to_now() {
        let parsed = parse_time(Some("2024-05-01T10:00:00Z"));
        assert_eq!(parsed.timestamp(), 1_714_557_600);
        assert!(parse_time(None) > parsed);
    }
}
