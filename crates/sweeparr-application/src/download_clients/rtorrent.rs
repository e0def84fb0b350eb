// SPDX-License-Identifier: GPL-3.0-or-later
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, Client, Url};
use sweeparr_config::DownloadClientConfig;
use tracing::{debug, warn};

use super::xmlrpc::{self, Value, XmlRpcError};
use super::{
    DownloadClientError, DownloadService, FileSelection, ServiceContext, TorrentFile, TorrentItem,
};

/// rTorrent's fault code for an unknown info-hash.
const UNKNOWN_HASH_FAULT: i64 = -501;

const DOWNLOAD_FIELDS: &[&str] = &[
    "d.hash=",
    "d.name=",
    "d.custom1=",
    "d.size_bytes=",
    "d.completed_bytes=",
    "d.down.rate=",
    "d.ratio=",
    "d.is_private=",
    "d.state=",
    "d.complete=",
    "d.directory=",
    "d.timestamp.finished=",
    "d.is_meta=",
];

pub struct RTorrentService {
    name: String,
    client: Client,
    endpoint: String,
    username: Option<String>,
    password: Option<String>,
    context: Arc<ServiceContext>,
}

impl RTorrentService {
    pub fn new(
        config: &DownloadClientConfig,
        context: Arc<ServiceContext>,
    ) -> Result<Self, DownloadClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            name: config.name.clone(),
            client,
            endpoint: config.base_url(),
            username: config.username.clone(),
            password: config.password.clone(),
            context,
        })
    }

    async fn call(&self, method: &str, params: &[Value]) -> Result<Value, DownloadClientError> {
        let url = Url::parse(&self.endpoint)
            .map_err(|err| DownloadClientError::InvalidBaseUrl(err.to_string()))?;
        let mut request = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "text/xml")
            .body(xmlrpc::encode_call(method, params));
        if let Some(username) = self.username.as_deref() {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(DownloadClientError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(xmlrpc::parse_response(&body)?)
    }

    async fn downloads(&self) -> Result<Vec<RTorrentDownload>, DownloadClientError> {
        let mut params = vec![Value::from(""), Value::from("main")];
        params.extend(DOWNLOAD_FIELDS.iter().map(|field| Value::from(*field)));

        let rows = self.call("d.multicall2", &params).await?;
        Ok(rows
            .as_array()
            .unwrap_or_default()
            .iter()
            .filter_map(Value::as_array)
            .map(RTorrentDownload::from_row)
            .collect())
    }

    async fn trackers(&self, hash: &str) -> Result<Vec<String>, DownloadClientError> {
        let rows = self
            .call(
                "t.multicall",
                &[Value::from(hash), Value::from(""), Value::from("t.url=")],
            )
            .await?;
        Ok(rows
            .as_array()
            .unwrap_or_default()
            .iter()
            .filter_map(|row| row.as_array()?.first()?.as_str().map(str::to_string))
            .filter(|url| !url.is_empty())
            .collect())
    }

    async fn with_trackers(&self, download: RTorrentDownload) -> Result<RTorrentItem, DownloadClientError> {
        let trackers = self.trackers(&download.hash).await?;
        Ok(RTorrentItem { download, trackers })
    }
}

fn is_unknown_hash(err: &DownloadClientError) -> bool {
    matches!(
        err,
        DownloadClientError::XmlRpc(XmlRpcError::Fault { code, .. }) if *code == UNKNOWN_HASH_FAULT
    )
}

#[async_trait]
impl DownloadService for RTorrentService {
    fn name(&self) -> &str {
        &self.name
    }

    fn context(&self) -> &ServiceContext {
        &self.context
    }

    async fn get_item(
        &self,
        hash: &str,
    ) -> Result<Option<Box<dyn TorrentItem>>, DownloadClientError> {
        let Some(download) = self
            .downloads()
            .await?
            .into_iter()
            .find(|download| download.hash.eq_ignore_ascii_case(hash))
        else {
            return Ok(None);
        };
        Ok(Some(Box::new(self.with_trackers(download).await?)))
    }

    async fn list_seeding(&self) -> Result<Vec<Box<dyn TorrentItem>>, DownloadClientError> {
        let mut items: Vec<Box<dyn TorrentItem>> = Vec::new();
        for download in self.downloads().await? {
            if !download.complete || download.hash.is_empty() {
                continue;
            }
            let hash = download.hash.clone();
            match self.with_trackers(download).await {
                Ok(item) => items.push(Box::new(item)),
                Err(err) => {
                    warn!(target: "rtorrent", client = %self.name, hash = %hash, error = %err, "skipping download without trackers");
                }
            }
        }
        Ok(items)
    }

    async fn get_files(
        &self,
        item: &dyn TorrentItem,
    ) -> Result<Vec<TorrentFile>, DownloadClientError> {
        let rows = self
            .call(
                "f.multicall",
                &[
                    Value::from(item.hash()),
                    Value::from(""),
                    Value::from("f.path="),
                    Value::from("f.size_bytes="),
                    Value::from("f.priority="),
                ],
            )
            .await?;

        Ok(rows
            .as_array()
            .unwrap_or_default()
            .iter()
            .filter_map(Value::as_array)
            .map(|row| TorrentFile {
                path: row.first().and_then(Value::as_str).unwrap_or_default().to_string(),
                size: row.get(1).and_then(Value::as_i64).unwrap_or_default().max(0) as u64,
                selection: if row.get(2).and_then(Value::as_i64) == Some(0) {
                    FileSelection::Unwanted
                } else {
                    FileSelection::Wanted
                },
            })
            .collect())
    }

    async fn delete_download(
        &self,
        hash: &str,
        delete_source_files: bool,
    ) -> Result<(), DownloadClientError> {
        let hash = hash.to_uppercase();
        let base_path = match self.call("d.base_path", &[Value::from(hash.as_str())]).await {
            Ok(value) => value.as_str().unwrap_or_default().to_string(),
            Err(err) if is_unknown_hash(&err) => {
                debug!(target: "rtorrent", client = %self.name, hash = %hash, "download already gone");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        self.call("d.erase", &[Value::from(hash.as_str())]).await?;

        if delete_source_files && !base_path.is_empty() {
            let path = Path::new(&base_path);
            let removal = match tokio::fs::metadata(path).await {
                Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(path).await,
                Ok(_) => tokio::fs::remove_file(path).await,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err),
            };
            removal?;
            debug!(target: "rtorrent", client = %self.name, hash = %hash, path = %base_path, "removed download data");
        }

        Ok(())
    }

    /// Labels live in `custom1` and need no registration.
    async fn create_category(&self, _name: &str) -> Result<(), DownloadClientError> {
        Ok(())
    }

    async fn apply_unlinked_category(
        &self,
        item: &mut dyn TorrentItem,
        category: &str,
    ) -> Result<(), DownloadClientError> {
        self.call(
            "d.custom1.set",
            &[Value::from(item.hash()), Value::from(category)],
        )
        .await?;
        item.set_category(category);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct RTorrentDownload {
    hash: String,
    name: String,
    label: String,
    size: i64,
    completed: i64,
    down_rate: i64,
    ratio: i64,
    private: bool,
    started: bool,
    complete: bool,
    directory: String,
    finished_at: i64,
    meta: bool,
}

impl RTorrentDownload {
    fn from_row(row: &[Value]) -> Self {
        let text = |index: usize| {
            row.get(index)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let int = |index: usize| row.get(index).and_then(Value::as_i64).unwrap_or_default();

        Self {
            hash: text(0),
            name: text(1),
            label: text(2),
            size: int(3),
            completed: int(4),
            down_rate: int(5),
            ratio: int(6),
            private: int(7) == 1,
            started: int(8) == 1,
            complete: int(9) == 1,
            directory: text(10),
            finished_at: int(11),
            meta: int(12) == 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RTorrentItem {
    download: RTorrentDownload,
    trackers: Vec<String>,
}

impl TorrentItem for RTorrentItem {
    fn hash(&self) -> &str {
        &self.download.hash
    }

    fn name(&self) -> &str {
        &self.download.name
    }

    fn category(&self) -> &str {
        &self.download.label
    }

    fn set_category(&mut self, category: &str) {
        self.download.label = category.to_string();
    }

    fn save_path(&self) -> &str {
        &self.download.directory
    }

    fn trackers(&self) -> &[String] {
        &self.trackers
    }

    fn is_private(&self) -> bool {
        self.download.private
    }

    fn size(&self) -> u64 {
        self.download.size.max(0) as u64
    }

    fn downloaded_bytes(&self) -> u64 {
        self.download.completed.max(0) as u64
    }

    fn download_speed(&self) -> u64 {
        self.download.down_rate.max(0) as u64
    }

    /// Seconds left at the current rate, 0 when not transferring.
    fn eta(&self) -> i64 {
        if self.download.down_rate <= 0 {
            return 0;
        }
        (self.download.size - self.download.completed).max(0) / self.download.down_rate
    }

    fn ratio(&self) -> f64 {
        self.download.ratio as f64 / 1000.0
    }

    fn seeding_time_seconds(&self) -> i64 {
        if self.download.finished_at <= 0 {
            return 0;
        }
        (Utc::now().timestamp() - self.download.finished_at).max(0)
    }

    fn is_downloading(&self) -> bool {
        self.download.started && !self.download.complete
    }

    fn is_stalled(&self) -> bool {
        self.is_downloading() && !self.download.meta && self.download.down_rate <= 0
    }

    fn is_seeding(&self) -> bool {
        self.download.started && self.download.complete
    }

    fn is_metadata_downloading(&self) -> bool {
        self.download.meta
    }

    fn clone_box(&self) -> Box<dyn TorrentItem> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download_clients::testing::ContextParts;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service(server: &MockServer) -> RTorrentService {
        let config = DownloadClientConfig {
            name: "rtorrent".to_string(),
            kind: "rtorrent".to_string(),
            host: format!("{}/RPC2", server.uri()),
            ..DownloadClientConfig::default()
        };
        RTorrentService::new(&config, ContextParts::default().build()).expect("client builds")
    }

    fn respond(values: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_string(format!(
            "<?xml version=\"1.0\"?><methodResponse><params><param><value>{values}</value></param></params></methodResponse>"
        ))
    }

    fn download_row(hash: &str, complete: i64, rate: i64, meta: i64) -> String {
        let values = [
            format!("<string>{hash}</string>"),
            "<string>Some.Movie.2021</string>".to_string(),
            "<string>radarr</string>".to_string(),
            "<i8>2048</i8>".to_string(),
            "<i8>1024</i8>".to_string(),
            format!("<i8>{rate}</i8>"),
            "<i8>2500</i8>".to_string(),
            "<i8>1</i8>".to_string(),
            "<i8>1</i8>".to_string(),
            format!("<i8>{complete}</i8>"),
            "<string>/downloads/radarr/Some.Movie.2021</string>".to_string(),
            "<i8>0</i8>".to_string(),
            format!("<i8>{meta}</i8>"),
        ];
        let cells: String = values.iter().map(|v| format!("<value>{v}</value>")).collect();
        format!("<value><array><data>{cells}</data></array></value>")
    }

    async fn mount_downloads(server: &MockServer, rows: &[String]) {
        Mock::given(method("POST"))
            .and(path("/RPC2"))
            .and(body_string_contains("d.multicall2"))
            .respond_with(respond(&format!("<array><data>{}</data></array>", rows.concat())))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/RPC2"))
            .and(body_string_contains("t.multicall"))
            .respond_with(respond(
                "<array><data><value><array><data><value><string>https://tracker.example.org/announce</string></value></data></array></value></data></array>",
            ))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn multicall_rows_map_to_items() {
        let server = MockServer::start().await;
        mount_downloads(&server, &[download_row("ABCDEF", 0, 0, 0), download_row("OTHER", 1, 0, 0)]).await;

        let item = service(&server)
            .get_item("abcdef")
            .await
            .expect("request succeeds")
            .expect("item exists");

        assert_eq!(item.hash(), "ABCDEF");
        assert_eq!(item.category(), "radarr");
        assert_eq!(item.ratio(), 2.5);
        assert!(item.is_private());
        assert!(item.is_stalled());
        assert_eq!(item.completion_percentage(), 50.0);
        assert_eq!(item.trackers().len(), 1);
    }

    #[tokio::test]
    async fn seeding_list_keeps_complete_downloads() {
        let server = MockServer::start().await;
        mount_downloads(&server, &[download_row("ABCDEF", 0, 10, 0), download_row("DONE", 1, 0, 0)]).await;

        let items = service(&server).get_seeding_downloads().await.expect("list");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].hash(), "DONE");
    }

    #[tokio::test]
    async fn metadata_download_is_struck() {
        let server = MockServer::start().await;
        mount_downloads(&server, &[download_row("META", 0, 0, 1)]).await;
        Mock::given(method("POST"))
            .and(path("/RPC2"))
            .and(body_string_contains("f.multicall"))
            .respond_with(respond("<array><data></data></array>"))
            .mount(&server)
            .await;

        let item = service(&server)
            .get_item("META")
            .await
            .expect("request succeeds")
            .expect("item exists");
        assert!(item.is_metadata_downloading());
        assert!(!item.is_stalled());
    }

    #[tokio::test]
    async fn deleting_unknown_hash_is_a_no_op() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/RPC2"))
            .and(body_string_contains("d.base_path"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<?xml version=\"1.0\"?><methodResponse><fault><value><struct>\
                 <member><name>faultCode</name><value><i4>-501</i4></value></member>\
                 <member><name>faultString</name><value><string>Could not find info-hash.</string></value></member>\
                 </struct></value></fault></methodResponse>",
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/RPC2"))
            .and(body_string_contains("d.erase"))
            .respond_with(respond("<i8>0</i8>"))
            .expect(0)
            .mount(&server)
            .await;

        service(&server)
            .delete_download("abcdef", true)
            .await
            .expect("unknown hash is fine");
    }

    #[tokio::test]
    async fn delete_erases_and_removes_data() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let data = dir.path().join("Some.Movie.2021");
        std::fs::create_dir(&data).expect("mkdir");
        std::fs::write(data.join("movie.mkv"), b"x").expect("write");

        Mock::given(method("POST"))
            .and(path("/RPC2"))
            .and(body_string_contains("d.base_path"))
            .respond_with(respond(&format!("<string>{}</string>", data.display())))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/RPC2"))
            .and(body_string_contains("d.erase"))
            .and(body_string_contains("ABCDEF"))
            .respond_with(respond("<i8>0</i8>"))
            .expect(1)
            .mount(&server)
            .await;

        service(&server)
            .delete_download("abcdef", true)
            .await
            .expect("delete succeeds");
        assert!(!data.exists());
    }

    #[tokio::test]
    async fn seeding_list_skips_download_erased_mid_listing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/RPC2"))
            .and(body_string_contains("d.multicall2"))
            .respond_with(respond(&format!(
                "<array><data>{}{}</data></array>",
                download_row("KEPT", 1, 0, 0),
                download_row("GONE", 1, 0, 0)
            )))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/RPC2"))
            .and(body_string_contains("t.multicall"))
            .and(body_string_contains("KEPT"))
            .respond_with(respond("<array><data></data></array>"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/RPC2"))
            .and(body_string_contains("t.multicall"))
            .and(body_string_contains("GONE"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<?xml version=\"1.0\"?><methodResponse><fault><value><struct>\
                 <member><name>faultCode</name><value><i4>-501</i4></value></member>\
                 <member><name>faultString</name><value><string>Could not find info-hash.</string></value></member>\
                 </struct></value></fault></methodResponse>",
            ))
            .mount(&server)
            .await;

        let items = service(&server).get_seeding_downloads().await.expect("list");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].hash(), "KEPT");
    }
}
