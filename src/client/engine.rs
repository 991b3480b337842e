use super::config::{ClientConfig, USER_AGENTS, is_discord_media_url};
use super::coordinator::Coordinator;
use crate::error::{Cancelled, ErrorKind, IqdbError, Result};
use crate::fetcher::{GetRequest, Headers, HttpFetcher, HttpTransport, UploadRequest};
use crate::normalizer::{self, ImageInput, MAX_FILE_SIZE};
use crate::parser::ResultParser;
use crate::types::{MoreResultsPointer, SearchResult};
use chrono::Utc;
use rand::Rng;
use rand::seq::IndexedRandom;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// 下載圖片時模擬瀏覽器的 headers
const DOWNLOAD_HEADERS: &[(&str, &str)] = &[
    ("Accept", "image/webp,image/apng,image/*,*/*;q=0.8"),
    ("Accept-Language", "en-US,en;q=0.9"),
    ("Cache-Control", "no-cache"),
    ("Pragma", "no-cache"),
    ("Sec-Fetch-Dest", "image"),
    ("Sec-Fetch-Mode", "no-cors"),
    ("Sec-Fetch-Site", "cross-site"),
];

/// 取消搜尋用的把手，可複製到其他 task
#[derive(Clone)]
pub struct CancelHandle {
    signal: Arc<watch::Sender<Option<Cancelled>>>,
}

impl CancelHandle {
    fn new() -> Self {
        let (signal, _) = watch::channel(None);
        Self {
            signal: Arc::new(signal),
        }
    }

    /// 取消進行中與之後的搜尋，直到 `reset`
    pub fn cancel(&self) {
        self.signal.send_replace(Some(Cancelled::Requested));
    }

    /// 同 `cancel`，但標記為中斷訊號（Ctrl+C）
    pub fn interrupt(&self) {
        self.signal.send_replace(Some(Cancelled::Interrupted));
    }

    pub fn reset(&self) {
        self.signal.send_replace(None);
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.borrow().is_some()
    }

    async fn cancelled(&self) -> Cancelled {
        let mut rx = self.signal.subscribe();
        let signal = rx.wait_for(Option::is_some).await.ok().and_then(|v| *v);
        match signal {
            Some(signal) => signal,
            None => std::future::pending().await,
        }
    }
}

/// 目前搜尋配置的快照
#[derive(Debug, Clone, Serialize)]
pub struct SearchInfo {
    pub service: String,
    pub base_url: String,
    pub ignore_colors: bool,
    pub search_more: bool,
    pub prevent_bans: bool,
    pub rate_limit_seconds: f64,
    pub max_retries: u32,
    pub supported_formats: Vec<&'static str>,
    pub supported_sources: Vec<&'static str>,
    pub max_file_size: String,
    pub session_id: String,
}

/// IQDB 搜尋客戶端
///
/// 同一個實例可被多個搜尋同時使用，所有請求共用一個限流器。
pub struct SearchClient {
    config: ClientConfig,
    transport: Arc<dyn HttpTransport>,
    coordinator: Coordinator,
    parser: ResultParser,
    session_id: String,
    cancel: CancelHandle,
}

impl SearchClient {
    /// 使用 reqwest 傳輸層建立客戶端
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = Arc::new(HttpFetcher::new(config.timeout, &config.user_agent)?);
        Self::with_transport(config, transport)
    }

    pub fn with_transport(config: ClientConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        let parser = ResultParser::new(&config.profile.base_url, config.debug_enabled())?;
        let coordinator = Coordinator::new(
            config.rate_limit,
            config.prevent_bans,
            config.max_retries,
            config.retry_delay,
        );

        Ok(Self {
            config,
            transport,
            coordinator,
            parser,
            session_id: generate_session_id(),
            cancel: CancelHandle::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// 取消狀態會一直保留：`cancel()` 之後所有搜尋都回傳 `UserCancelled`，
    /// 要繼續使用同一個客戶端必須先呼叫 `CancelHandle::reset`。
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// 以圖片 URL 搜尋
    ///
    /// `force_download` 為 None 時依配置的下載策略決定。直接送 URL 被回報
    /// 「不是圖片」時，會改為自行下載後上傳。
    pub async fn search_by_url(&self, url: &str, force_download: Option<bool>) -> Result<SearchResult> {
        self.guarded(async {
            let result = self.search_url_inner(url, force_download).await?;
            Ok(self.follow_more_results(result).await)
        })
        .await
    }

    /// 以檔案路徑、bytes 或串流搜尋
    pub async fn search_by_file(&self, input: impl Into<ImageInput>) -> Result<SearchResult> {
        let input = input.into();
        self.guarded(async {
            let result = self.search_file_inner(input).await?;
            Ok(self.follow_more_results(result).await)
        })
        .await
    }

    /// 取得「更多結果」頁並取代原結果
    ///
    /// 盡力而為：沒有連結時原樣回傳，任何失敗（包含取消）也回傳原結果。
    pub async fn fetch_more_results(&self, result: SearchResult) -> SearchResult {
        let Some(pointer) = result.more_results_pointer.clone() else {
            return result;
        };

        match self.guarded(self.fetch_pointer(&pointer)).await {
            Ok(more) => {
                tracing::info!("更多結果: {} 筆 (原本 {} 筆)", more.matches.len(), result.matches.len());
                more
            }
            Err(e) => {
                tracing::warn!("無法取得更多結果，沿用原結果: {}", e);
                result
            }
        }
    }

    pub fn search_info(&self) -> SearchInfo {
        SearchInfo {
            service: self.config.profile.name.to_string(),
            base_url: self.config.profile.base_url.clone(),
            ignore_colors: self.config.ignore_colors,
            search_more: self.config.search_more,
            prevent_bans: self.config.prevent_bans,
            rate_limit_seconds: self.config.rate_limit.as_secs_f64(),
            max_retries: self.config.max_retries,
            supported_formats: normalizer::supported_image_formats(),
            supported_sources: self.config.profile.supported_sources(),
            max_file_size: "8MB".to_string(),
            session_id: self.session_id.clone(),
        }
    }

    /// 在每個等待點檢查取消
    async fn guarded<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            signal = self.cancel.cancelled() => {
                tracing::info!("搜尋已取消: {}", signal);
                Err(IqdbError::UserCancelled { source: signal })
            }
            result = operation => result,
        }
    }

    async fn search_url_inner(&self, url: &str, force_download: Option<bool>) -> Result<SearchResult> {
        let url = url.trim();
        if url.is_empty() {
            return Err(IqdbError::invalid_argument("圖片 URL 不可為空"));
        }

        let should_download = force_download.unwrap_or_else(|| (self.config.download_policy)(url));

        if should_download {
            return match self.download_and_search(url).await {
                Err(e)
                    if matches!(e.kind(), ErrorKind::HttpRequestFailed | ErrorKind::NotAnImage)
                        && !is_discord_media_url(url) =>
                {
                    tracing::warn!("下載搜尋失敗 ({})，改為直接送 URL", e);
                    self.search_url_direct(url).await
                }
                other => other,
            };
        }

        match self.search_url_direct(url).await {
            Err(err) if err.kind() == ErrorKind::NotAnImage => {
                tracing::info!("IQDB 無法讀取該 URL，改為下載後上傳: {}", url);
                match self.download_image(url).await {
                    Ok(bytes) => self.search_file_inner(ImageInput::Bytes(bytes)).await,
                    Err(download_err) => Err(err.caused_by(download_err)),
                }
            }
            other => other,
        }
    }

    async fn download_and_search(&self, url: &str) -> Result<SearchResult> {
        let bytes = self.download_image(url).await?;
        self.search_file_inner(ImageInput::Bytes(bytes)).await
    }

    async fn search_url_direct(&self, url: &str) -> Result<SearchResult> {
        let mut params = vec![("url".to_string(), url.to_string())];
        params.extend(
            self.config
                .profile
                .prepare_search_payload(&self.config.payload_options(), false),
        );

        if self.parser_debug() {
            tracing::debug!("GET 參數: {:?}", params);
        }

        let request = GetRequest {
            url: format!("{}?{}", self.config.profile.endpoint(), encode_query(&params)),
            headers: self.request_headers(),
        };

        let transport = &*self.transport;
        let request = &request;
        let html = self.coordinator.execute(|| transport.get(request)).await?;
        self.parser.parse(&html)
    }

    async fn search_file_inner(&self, input: ImageInput) -> Result<SearchResult> {
        let file = normalizer::normalize(input)?;
        if file.len() > MAX_FILE_SIZE {
            return Err(IqdbError::image_too_large(format!(
                "{} bytes，上限為 {} bytes",
                file.len(),
                MAX_FILE_SIZE
            )));
        }

        let fields = self
            .config
            .profile
            .prepare_search_payload(&self.config.payload_options(), true);
        if self.parser_debug() {
            tracing::debug!("上傳 {} ({} bytes)，欄位: {:?}", file.filename, file.len(), fields);
        }

        let mut headers = self.request_headers();
        headers.extend(self.config.profile.upload_headers.iter().cloned());

        let request = UploadRequest {
            url: self.config.profile.endpoint(),
            fields,
            file,
            headers,
        };

        let transport = &*self.transport;
        let request = &request;
        let html = self.coordinator.execute(|| transport.upload(request)).await?;
        self.parser.parse(&html)
    }

    async fn fetch_pointer(&self, pointer: &MoreResultsPointer) -> Result<SearchResult> {
        let url = reqwest::Url::parse(&self.config.profile.endpoint())
            .and_then(|base| base.join(&pointer.href))
            .map_err(|e| IqdbError::structure(format!("更多結果連結無效: {}", pointer.href)).caused_by(e))?;

        let request = GetRequest {
            url: url.to_string(),
            headers: self.request_headers(),
        };

        let transport = &*self.transport;
        let request = &request;
        let html = self.coordinator.execute(|| transport.get(request)).await?;
        self.parser.parse(&html)
    }

    async fn follow_more_results(&self, result: SearchResult) -> SearchResult {
        if self.config.include_more_results {
            self.fetch_more_results(result).await
        } else {
            result
        }
    }

    /// 下載圖片；內容類型不像圖片時放寬 Accept 再試一次
    async fn download_image(&self, url: &str) -> Result<Vec<u8>> {
        let mut headers = self.request_headers();
        headers.extend(
            DOWNLOAD_HEADERS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        if is_discord_media_url(url) {
            headers.push(("Referer".to_string(), "https://discord.com/".to_string()));
            headers.push(("Origin".to_string(), "https://discord.com".to_string()));
        }

        let downloaded = self.transport.download(url, &headers).await?;
        if looks_like_image(downloaded.content_type.as_deref()) {
            return Ok(downloaded.bytes);
        }

        tracing::debug!("內容類型 {:?} 不是圖片，改用 Accept: */* 重試", downloaded.content_type);
        for (name, value) in headers.iter_mut() {
            if name == "Accept" {
                *value = "*/*".to_string();
            }
        }
        Ok(self.transport.download(url, &headers).await?.bytes)
    }

    fn request_headers(&self) -> Headers {
        let user_agent = if self.config.prevent_bans {
            USER_AGENTS
                .choose(&mut rand::rng())
                .copied()
                .unwrap_or(self.config.user_agent.as_str())
                .to_string()
        } else {
            self.config.user_agent.clone()
        };
        vec![("User-Agent".to_string(), user_agent)]
    }

    fn parser_debug(&self) -> bool {
        self.config.debug_enabled()
    }
}

fn looks_like_image(content_type: Option<&str>) -> bool {
    content_type
        .map(str::to_lowercase)
        .is_some_and(|ct| ct.contains("image/") || ct.contains("application/octet-stream"))
}

fn encode_query(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// 16 位十六進位的 session id
fn generate_session_id() -> String {
    let mut hasher = Sha256::new();
    hasher.update(Utc::now().timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher.update(rand::rng().random::<u64>().to_le_bytes());
    let hash = format!("{:x}", hasher.finalize());
    hash[..16].to_string()
}
