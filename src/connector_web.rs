//! Web connectors: raw pages, Wikipedia articles, YouTube transcripts.
//!
//! - `web_page` — fetch each URL and keep the HTML (the parser strips it).
//! - `wikipedia` — fetch page wikitext via the MediaWiki REST API; accepts
//!   bare titles or full article URLs.
//! - `youtube` — fetch the timedtext transcript for each video id and strip
//!   the caption XML to plain text.
//!
//! These families have no durable change ordering, so they do not implement
//! the sync change feed.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::connector::{
    classify_source_status, ConnectorProgress, DocumentStream, ProgressFn, SourceConnector,
};
use crate::error::EngineError;
use crate::models::{Document, SourceSpec};

pub struct WebConnector {
    spec: SourceSpec,
    client: reqwest::Client,
}

impl WebConnector {
    pub fn new(spec: SourceSpec) -> Self {
        Self {
            spec,
            client: reqwest::Client::new(),
        }
    }

    fn targets(&self) -> &[String] {
        match &self.spec {
            SourceSpec::WebPage { urls } => urls,
            SourceSpec::Wikipedia { pages } => pages,
            SourceSpec::Youtube { urls } => urls,
            other => unreachable!("WebConnector dispatched for {}", other.family()),
        }
    }

    async fn get_text(&self, url: &str, context: &str) -> Result<String, EngineError> {
        let resp = self
            .client
            .get(url)
            .header("User-Agent", "lattice/0.3 (hybrid retrieval engine)")
            .send()
            .await
            .map_err(|e| EngineError::source_transient(format!("{context}: {e}")))?;
        if !resp.status().is_success() {
            return Err(classify_source_status(resp.status(), context));
        }
        resp.text()
            .await
            .map_err(|e| EngineError::source_transient(format!("{context}: {e}")))
    }

    async fn fetch(&self, target: &str) -> Result<Document, EngineError> {
        match &self.spec {
            SourceSpec::WebPage { .. } => {
                let body = self.get_text(target, target).await?;
                Ok(Document::from_bytes(
                    target,
                    target,
                    page_name(target),
                    "html",
                    body.into_bytes(),
                ))
            }
            SourceSpec::Wikipedia { .. } => {
                let title = wikipedia_title(target);
                let url = format!(
                    "https://en.wikipedia.org/w/rest.php/v1/page/{}",
                    title.replace(' ', "_")
                );
                let body = self.get_text(&url, &title).await?;
                let json: serde_json::Value = serde_json::from_str(&body)
                    .map_err(|e| EngineError::source_permanent(format!("{title}: {e}")))?;
                let source = json["source"].as_str().unwrap_or_default().to_string();
                if source.is_empty() {
                    return Err(EngineError::Source {
                        kind: crate::error::SourceErrorKind::NotFound,
                        message: format!("wikipedia page '{title}' has no content"),
                    });
                }
                Ok(Document::from_bytes(
                    format!("wikipedia:{title}"),
                    title.clone(),
                    title,
                    "txt",
                    source.into_bytes(),
                ))
            }
            SourceSpec::Youtube { .. } => {
                let video_id = youtube_video_id(target).ok_or_else(|| {
                    EngineError::source_permanent(format!("not a YouTube URL: {target}"))
                })?;
                let url =
                    format!("https://www.youtube.com/api/timedtext?v={video_id}&lang=en&fmt=srv1");
                let xml = self.get_text(&url, &video_id).await?;
                let transcript = strip_caption_xml(&xml);
                if transcript.is_empty() {
                    return Err(EngineError::Source {
                        kind: crate::error::SourceErrorKind::NotFound,
                        message: format!("no transcript available for video {video_id}"),
                    });
                }
                Ok(Document::from_bytes(
                    format!("youtube:{video_id}"),
                    video_id.clone(),
                    format!("YouTube {video_id}"),
                    "txt",
                    transcript.into_bytes(),
                ))
            }
            other => unreachable!("WebConnector dispatched for {}", other.family()),
        }
    }
}

#[async_trait]
impl SourceConnector for WebConnector {
    fn kind(&self) -> &'static str {
        self.spec.family()
    }

    async fn enumerate(
        &self,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<(usize, DocumentStream), EngineError> {
        let targets: Vec<String> = self.targets().to_vec();
        let total = targets.len();
        progress(ConnectorProgress::SetTotal(total));

        let connector = WebConnector::new(self.spec.clone());
        let stream = async_stream::stream! {
            for target in targets {
                if cancel.is_cancelled() {
                    return;
                }
                match connector.fetch(&target).await {
                    Ok(doc) => {
                        progress(ConnectorProgress::Fetched {
                            logical_path: doc.logical_path.clone(),
                        });
                        yield Ok(doc);
                    }
                    Err(e) => {
                        warn!(target = %target, error = %e, "web fetch failed");
                        yield Err(e);
                    }
                }
            }
        };

        Ok((total, Box::pin(stream)))
    }
}

/// Display name for a web page: last non-empty path segment or the host.
fn page_name(url: &str) -> String {
    let trimmed = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed).to_string()
}

/// Accept either a bare title or a full `/wiki/<title>` URL.
fn wikipedia_title(target: &str) -> String {
    if let Some(pos) = target.find("/wiki/") {
        target[pos + "/wiki/".len()..]
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .replace('_', " ")
    } else {
        target.to_string()
    }
}

/// Extract the video id from the common YouTube URL shapes.
fn youtube_video_id(url: &str) -> Option<String> {
    if let Some(pos) = url.find("v=") {
        let id: String = url[pos + 2..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        return (!id.is_empty()).then_some(id);
    }
    if let Some(pos) = url.find("youtu.be/") {
        let id: String = url[pos + "youtu.be/".len()..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        return (!id.is_empty()).then_some(id);
    }
    None
}

/// Strip timedtext XML down to the caption text.
fn strip_caption_xml(xml: &str) -> String {
    let mut out = String::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<text") {
        let Some(open_end) = rest[start..].find('>') else { break };
        let content_start = start + open_end + 1;
        let Some(end) = rest[content_start..].find("</text>") else { break };
        let caption = &rest[content_start..content_start + end];
        if !out.is_empty() && !caption.is_empty() {
            out.push(' ');
        }
        out.push_str(caption);
        rest = &rest[content_start + end + "</text>".len()..];
    }
    out.replace("&amp;", "&")
        .replace("&#39;", "'")
        .replace("&quot;", "\"")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wikipedia_titles_from_urls_and_bare_names() {
        assert_eq!(
            wikipedia_title("https://en.wikipedia.org/wiki/Mars_rover#History"),
            "Mars rover"
        );
        assert_eq!(wikipedia_title("Perseverance (rover)"), "Perseverance (rover)");
    }

    #[test]
    fn youtube_ids_from_both_url_shapes() {
        assert_eq!(
            youtube_video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=1s").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            youtube_video_id("https://youtu.be/dQw4w9WgXcQ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert!(youtube_video_id("https://example.com/video").is_none());
    }

    #[test]
    fn caption_xml_is_stripped() {
        let xml = r#"<transcript><text start="0" dur="2">Hello there</text><text start="2" dur="3">General &amp; Kenobi</text></transcript>"#;
        assert_eq!(strip_caption_xml(xml), "Hello there General & Kenobi");
    }

    #[test]
    fn page_names_are_short() {
        assert_eq!(page_name("https://docs.example.com/guides/intro/"), "intro");
        assert_eq!(page_name("https://example.com"), "example.com");
    }

    #[tokio::test]
    async fn change_feed_is_unsupported() {
        let connector = WebConnector::new(SourceSpec::WebPage {
            urls: vec!["https://example.com".to_string()],
        });
        let err = connector.fetch_changes(0).await.unwrap_err();
        assert_eq!(err.kind(), "SourceError.permanent");
    }
}
