use super::client::{DocumentStore, ItemOutcome, Refresh};
use super::config::StoreConfig;
use super::error::StoreError;
use crate::models::{BulkItemError, DocumentUpdate, EmailDocument};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;

const CATEGORY_FIELD: &str = "aiCategory";
const CATEGORY_BUCKETS: usize = 10;

/// Elasticsearch-backed [`DocumentStore`] speaking the REST API over `reqwest`.
#[derive(Clone)]
pub struct ElasticsearchStore {
    http: Client,
    base_url: Url,
    index: String,
    api_key: Option<String>,
}

impl ElasticsearchStore {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent("inbox-indexer/0.1")
            .build()?;

        let base_url = Url::parse(config.base_url.trim_end_matches('/'))
            .map_err(|err| StoreError::InvalidUrl(format!("{}: {err}", config.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::InvalidUrl(config.base_url.clone()));
        }

        Ok(Self {
            http,
            base_url,
            index: config.index.clone(),
            api_key: config.api_key.clone(),
        })
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// Fails unless the cluster answers its root endpoint.
    pub async fn healthcheck(&self) -> Result<(), StoreError> {
        let response = self.request(Method::GET, &[], None)?.send().await?;
        ensure_success(response).await.map(|_| ())
    }

    fn url_for(&self, segments: &[&str], refresh: Option<Refresh>) -> Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| StoreError::InvalidUrl(self.base_url.to_string()))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }

        if let Some(value) = refresh.and_then(|refresh| refresh.as_query()) {
            url.query_pairs_mut().append_pair("refresh", value);
        }

        Ok(url)
    }

    fn request(
        &self,
        method: Method,
        segments: &[&str],
        refresh: Option<Refresh>,
    ) -> Result<RequestBuilder, StoreError> {
        let url = self.url_for(segments, refresh)?;
        Ok(self.apply_auth(self.http.request(method, url)))
    }

    fn apply_auth(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(ref key) = self.api_key {
            request.header("Authorization", format!("ApiKey {}", key))
        } else {
            request
        }
    }

    async fn send_json<T: Serialize + ?Sized>(
        &self,
        method: Method,
        segments: &[&str],
        refresh: Option<Refresh>,
        payload: &T,
    ) -> Result<reqwest::Response, StoreError> {
        let response = self
            .request(method, segments, refresh)?
            .json(payload)
            .send()
            .await?;
        ensure_success(response).await
    }

    async fn send_bulk(&self, body: String, refresh: Refresh) -> Result<BulkResponse, StoreError> {
        let response = self
            .request(Method::POST, &["_bulk"], Some(refresh))?
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl DocumentStore for ElasticsearchStore {
    async fn ensure_index(&self) -> Result<(), StoreError> {
        let response = self
            .request(Method::HEAD, &[self.index.as_str()], None)?
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => return Ok(()),
            StatusCode::NOT_FOUND => {}
            other => return Err(StoreError::status(other, read_body(response).await)),
        }

        let response = self
            .request(Method::PUT, &[self.index.as_str()], None)?
            .json(&index_mappings())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            info!("elasticsearch: created index `{}`", self.index);
            return Ok(());
        }

        let body = read_body(response).await;
        if status == StatusCode::BAD_REQUEST && body.contains("resource_already_exists_exception") {
            return Ok(());
        }

        Err(StoreError::status(status, body))
    }

    async fn upsert(&self, document: &EmailDocument, refresh: Refresh) -> Result<(), StoreError> {
        self.send_json(
            Method::PUT,
            &[self.index.as_str(), "_doc", document.id.as_str()],
            Some(refresh),
            document,
        )
        .await?;
        Ok(())
    }

    async fn bulk_upsert(
        &self,
        documents: &[EmailDocument],
        refresh: Refresh,
    ) -> Result<Vec<ItemOutcome>, StoreError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            "elasticsearch bulk_upsert: sending {} documents to `{}`",
            documents.len(),
            self.index
        );

        let body = bulk_index_body(&self.index, documents)?;
        let response = self.send_bulk(body, refresh).await?;
        Ok(response.into_outcomes())
    }

    async fn update_fields(
        &self,
        id: &str,
        update: &DocumentUpdate,
        refresh: Refresh,
    ) -> Result<(), StoreError> {
        self.send_json(
            Method::POST,
            &[self.index.as_str(), "_update", id],
            Some(refresh),
            &json!({ "doc": update }),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, id: &str, refresh: Refresh) -> Result<(), StoreError> {
        let response = self
            .request(Method::DELETE, &[self.index.as_str(), "_doc", id], Some(refresh))?
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!("elasticsearch delete: document {id} already absent");
                Ok(())
            }
            other => Err(StoreError::status(other, read_body(response).await)),
        }
    }

    async fn bulk_delete(&self, ids: &[String], refresh: Refresh) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }

        let body = bulk_delete_body(&self.index, ids)?;
        let response = self.send_bulk(body, refresh).await?;

        let rejected: Vec<String> = response
            .into_outcomes()
            .into_iter()
            .zip(ids)
            .filter_map(|(outcome, id)| match outcome {
                ItemOutcome::Rejected(error) => Some(format!("{id}: {error}")),
                ItemOutcome::Applied => None,
            })
            .collect();

        if rejected.is_empty() {
            Ok(())
        } else {
            Err(StoreError::status(
                StatusCode::CONFLICT,
                format!("{} deletes rejected: {}", rejected.len(), rejected.join("; ")),
            ))
        }
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        let response = self
            .request(Method::HEAD, &[self.index.as_str(), "_doc", id], None)?
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => Err(StoreError::status(other, read_body(response).await)),
        }
    }

    async fn count(&self) -> Result<u64, StoreError> {
        #[derive(Deserialize)]
        struct CountResponse {
            count: u64,
        }

        let response = self
            .request(Method::GET, &[self.index.as_str(), "_count"], None)?
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let bytes = response.bytes().await?;
        let parsed: CountResponse = serde_json::from_slice(&bytes)?;
        Ok(parsed.count)
    }

    async fn size_in_bytes(&self) -> Result<u64, StoreError> {
        let response = self
            .request(Method::GET, &[self.index.as_str(), "_stats", "store"], None)?
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let bytes = response.bytes().await?;
        let stats: Value = serde_json::from_slice(&bytes)?;
        Ok(store_size_from_stats(&stats, &self.index))
    }

    async fn category_counts(&self) -> Result<HashMap<String, u64>, StoreError> {
        let payload = json!({
            "size": 0,
            "aggs": {
                "categories": {
                    "terms": { "field": CATEGORY_FIELD, "size": CATEGORY_BUCKETS }
                }
            }
        });

        let response = self
            .send_json(
                Method::POST,
                &[self.index.as_str(), "_search"],
                None,
                &payload,
            )
            .await?;
        let bytes = response.bytes().await?;
        let parsed: AggregationResponse = serde_json::from_slice(&bytes)?;
        Ok(parsed.into_counts())
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    Err(StoreError::status(status, read_body(response).await))
}

async fn read_body(response: reqwest::Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|_| "failed to read error body".to_string())
}

fn index_mappings() -> Value {
    json!({
        "mappings": {
            "properties": {
                "id": { "type": "keyword" },
                "accountId": { "type": "keyword" },
                "folder": { "type": "keyword" },
                "subject": { "type": "text" },
                "body": { "type": "text" },
                "from": { "type": "text" },
                "to": { "type": "keyword" },
                "cc": { "type": "keyword" },
                "date": { "type": "date" },
                "aiCategory": { "type": "keyword" },
                "indexedAt": { "type": "date" },
                "hasAttachments": { "type": "boolean" },
                "flags": { "type": "keyword" }
            }
        }
    })
}

/// Newline-delimited bulk body: one `index` action line followed by the
/// document source, per document, in input order.
fn bulk_index_body(index: &str, documents: &[EmailDocument]) -> Result<String, StoreError> {
    let mut body = String::new();
    for document in documents {
        let action = json!({ "index": { "_index": index, "_id": document.id } });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(document)?);
        body.push('\n');
    }
    Ok(body)
}

fn bulk_delete_body(index: &str, ids: &[String]) -> Result<String, StoreError> {
    let mut body = String::new();
    for id in ids {
        let action = json!({ "delete": { "_index": index, "_id": id } });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
    }
    Ok(body)
}

fn store_size_from_stats(stats: &Value, index: &str) -> u64 {
    stats
        .get("indices")
        .and_then(|indices| indices.get(index))
        .and_then(|entry| entry.pointer("/primaries/store/size_in_bytes"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<HashMap<String, BulkResponseItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkResponseItem {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<BulkResponseError>,
}

#[derive(Debug, Deserialize)]
struct BulkResponseError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    reason: Option<String>,
}

impl BulkResponse {
    fn into_outcomes(self) -> Vec<ItemOutcome> {
        self.items
            .into_iter()
            .map(|entry| {
                // each entry is keyed by its action name (`index`, `delete`, ...)
                match entry.into_values().next() {
                    Some(BulkResponseItem {
                        status,
                        error: Some(error),
                    }) => ItemOutcome::Rejected(BulkItemError {
                        status,
                        kind: error.kind,
                        reason: error.reason.unwrap_or_default(),
                    }),
                    Some(_) => ItemOutcome::Applied,
                    None => ItemOutcome::Rejected(BulkItemError {
                        status: 0,
                        kind: "empty_item".to_string(),
                        reason: "bulk response item carried no action".to_string(),
                    }),
                }
            })
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
struct AggregationResponse {
    #[serde(default)]
    aggregations: Option<Aggregations>,
}

#[derive(Debug, Deserialize)]
struct Aggregations {
    categories: TermsAggregation,
}

#[derive(Debug, Deserialize)]
struct TermsAggregation {
    #[serde(default)]
    buckets: Vec<TermsBucket>,
}

#[derive(Debug, Deserialize)]
struct TermsBucket {
    key: Value,
    doc_count: u64,
}

impl AggregationResponse {
    fn into_counts(self) -> HashMap<String, u64> {
        self.aggregations
            .map(|aggs| {
                aggs.categories
                    .buckets
                    .into_iter()
                    .map(|bucket| {
                        let key = match bucket.key {
                            Value::String(value) => value,
                            other => other.to_string(),
                        };
                        (key, bucket.doc_count)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Category;
    use chrono::{TimeZone, Utc};

    fn document(id: &str) -> EmailDocument {
        EmailDocument {
            id: id.to_string(),
            account_id: "account-1".into(),
            folder: "INBOX".into(),
            subject: "Subject".into(),
            body: "Body".into(),
            from: "sender@example.com".into(),
            to: vec!["me@example.com".into()],
            cc: None,
            date: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            ai_category: Category::Uncategorized,
            indexed_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 5).unwrap(),
            has_attachments: false,
            flags: vec![],
        }
    }

    #[test]
    fn bulk_body_pairs_actions_with_sources_in_order() {
        let body = bulk_index_body("emails", &[document("a"), document("b")]).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(body.ends_with('\n'));

        let first_action: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first_action["index"]["_id"], "a");
        assert_eq!(first_action["index"]["_index"], "emails");

        let second_source: Value = serde_json::from_str(lines[3]).unwrap();
        assert_eq!(second_source["id"], "b");
        assert_eq!(second_source["aiCategory"], "Uncategorized");
    }

    #[test]
    fn bulk_response_maps_item_errors_by_position() {
        let raw = r#"{
            "took": 3,
            "errors": true,
            "items": [
                {"index": {"_id": "a", "status": 201}},
                {"index": {"_id": "b", "status": 400, "error": {"type": "mapper_parsing_exception", "reason": "bad date"}}},
                {"index": {"_id": "c", "status": 200}}
            ]
        }"#;

        let parsed: BulkResponse = serde_json::from_str(raw).unwrap();
        let outcomes = parsed.into_outcomes();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_applied());
        assert_eq!(
            outcomes[1],
            ItemOutcome::Rejected(BulkItemError {
                status: 400,
                kind: "mapper_parsing_exception".into(),
                reason: "bad date".into(),
            })
        );
        assert!(outcomes[2].is_applied());
    }

    #[test]
    fn aggregation_buckets_become_counts() {
        let raw = r#"{"aggregations": {"categories": {"buckets": [
            {"key": "Interested", "doc_count": 4},
            {"key": "Spam", "doc_count": 2}
        ]}}}"#;
        let parsed: AggregationResponse = serde_json::from_str(raw).unwrap();
        let counts = parsed.into_counts();
        assert_eq!(counts.get("Interested"), Some(&4));
        assert_eq!(counts.get("Spam"), Some(&2));

        let empty: AggregationResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.into_counts().is_empty());
    }

    #[test]
    fn store_size_reads_primaries() {
        let stats = json!({
            "indices": { "emails": { "primaries": { "store": { "size_in_bytes": 2048 } } } }
        });
        assert_eq!(store_size_from_stats(&stats, "emails"), 2048);
        assert_eq!(store_size_from_stats(&stats, "other"), 0);
    }

    #[test]
    fn urls_escape_ids_and_carry_refresh() {
        let store = ElasticsearchStore::new(&StoreConfig {
            base_url: "http://localhost:9200/".into(),
            ..StoreConfig::default()
        })
        .unwrap();

        let url = store
            .url_for(&["emails", "_doc", "a/b c"], Some(Refresh::WaitFor))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:9200/emails/_doc/a%2Fb%20c?refresh=wait_for"
        );

        let plain = store.url_for(&["emails", "_count"], Some(Refresh::None)).unwrap();
        assert_eq!(plain.as_str(), "http://localhost:9200/emails/_count");
    }
}
