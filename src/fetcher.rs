use crate::error::{IqdbError, Result};
use crate::normalizer::NormalizedImage;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;

/// 額外的 request headers
pub type Headers = Vec<(String, String)>;

/// GET 請求（query string 已組好）
#[derive(Debug, Clone)]
pub struct GetRequest {
    pub url: String,
    pub headers: Headers,
}

/// multipart 上傳請求
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub url: String,
    pub fields: Vec<(String, String)>,
    pub file: NormalizedImage,
    pub headers: Headers,
}

/// 下載回來的原始內容
#[derive(Debug, Clone)]
pub struct Downloaded {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// HTTP 傳輸層 - 抽象介面，方便替換與測試
///
/// 實作需跟隨轉址，並把非 2xx 回應轉成錯誤（413 → `ImageTooLarge`）。
/// 同一個 request 可能被呼叫多次，不可消耗掉 request 內容。
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// 取回 HTML
    async fn get(&self, request: &GetRequest) -> Result<String>;

    /// 上傳圖片並取回 HTML
    async fn upload(&self, request: &UploadRequest) -> Result<String>;

    /// 下載圖片原始內容
    async fn download(&self, url: &str, headers: &Headers) -> Result<Downloaded>;
}

/// reqwest 實作
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// 建立新的 HTTP Fetcher，`timeout` 為 None 時不設上限
    pub fn new(timeout: Option<Duration>, user_agent: &str) -> Result<Self> {
        let mut builder = Client::builder()
            .user_agent(user_agent.to_string())
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(10));

        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let client = builder
            .build()
            .map_err(|e| IqdbError::http("無法建立 HTTP 客戶端").caused_by(e))?;

        Ok(Self { client })
    }

    async fn send(&self, builder: RequestBuilder, headers: &Headers) -> Result<Response> {
        let response = builder
            .headers(header_map(headers)?)
            .send()
            .await
            .map_err(|e| IqdbError::http(format!("請求失敗: {}", e)).caused_by(e))?;

        check_status(response)
    }
}

#[async_trait]
impl HttpTransport for HttpFetcher {
    async fn get(&self, request: &GetRequest) -> Result<String> {
        let response = self.send(self.client.get(&request.url), &request.headers).await?;
        read_text(response).await
    }

    async fn upload(&self, request: &UploadRequest) -> Result<String> {
        let part = Part::bytes(request.file.bytes.clone())
            .file_name(request.file.filename.clone())
            .mime_str(request.file.mime_type())
            .map_err(|e| IqdbError::http("無法建立上傳內容").caused_by(e))?;

        let form = request
            .fields
            .iter()
            .fold(Form::new(), |form, (key, value)| form.text(key.clone(), value.clone()))
            .part("file", part);

        let response = self
            .send(self.client.post(&request.url).multipart(form), &request.headers)
            .await?;
        read_text(response).await
    }

    async fn download(&self, url: &str, headers: &Headers) -> Result<Downloaded> {
        let response = self.send(self.client.get(url), headers).await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| IqdbError::http(format!("讀取回應失敗: {}", e)).caused_by(e))?;

        Ok(Downloaded {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

fn check_status(response: Response) -> Result<Response> {
    classify_status(response.status())?;
    Ok(response)
}

/// 413 → `ImageTooLarge`，其餘 4xx/5xx → `HttpRequestFailed`
fn classify_status(status: StatusCode) -> Result<()> {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        return Err(IqdbError::image_too_large(format!("伺服器拒絕: {}", status)));
    }
    if status.is_client_error() || status.is_server_error() {
        return Err(IqdbError::http(format!("HTTP 錯誤: {}", status)));
    }
    Ok(())
}

async fn read_text(response: Response) -> Result<String> {
    response
        .text()
        .await
        .map_err(|e| IqdbError::http(format!("讀取回應失敗: {}", e)).caused_by(e))
}

fn header_map(headers: &Headers) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| IqdbError::invalid_argument(format!("header 名稱無效: {}", name)).caused_by(e))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| IqdbError::invalid_argument(format!("header 值無效: {}", value)).caused_by(e))?;
        // User-Agent 以每次請求指定的為準
        if name == USER_AGENT {
            map.insert(name, value);
        } else {
            map.append(name, value);
        }
    }
    Ok(map)
}

#[cfg(test)]
pub(crate) mod mock {
    //! 測試用的腳本化傳輸層：依序回放預先準備的回應並記錄送出時間
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    pub type Reply = Result<String>;

    #[derive(Default)]
    pub struct ScriptedTransport {
        pages: Mutex<VecDeque<Reply>>,
        /// 空了之後一直回這個
        fallback: Mutex<Option<String>>,
        downloads: Mutex<VecDeque<Result<Downloaded>>>,
        pub calls: Mutex<Vec<(String, Instant)>>,
        pub uploads: Mutex<Vec<UploadRequest>>,
        pub gets: Mutex<Vec<GetRequest>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reply(self, reply: Reply) -> Self {
            self.pages.lock().unwrap().push_back(reply);
            self
        }

        pub fn always(self, html: &str) -> Self {
            *self.fallback.lock().unwrap() = Some(html.to_string());
            self
        }

        pub fn download_reply(self, reply: Result<Downloaded>) -> Self {
            self.downloads.lock().unwrap().push_back(reply);
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        pub fn dispatch_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().iter().map(|(_, t)| *t).collect()
        }

        fn next_page(&self, label: &str) -> Reply {
            self.calls.lock().unwrap().push((label.to_string(), Instant::now()));
            if let Some(reply) = self.pages.lock().unwrap().pop_front() {
                return reply;
            }
            self.fallback
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| IqdbError::http("腳本已用完"))
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn get(&self, request: &GetRequest) -> Result<String> {
            self.gets.lock().unwrap().push(request.clone());
            self.next_page("get")
        }

        async fn upload(&self, request: &UploadRequest) -> Result<String> {
            self.uploads.lock().unwrap().push(request.clone());
            self.next_page("upload")
        }

        async fn download(&self, _url: &str, _headers: &Headers) -> Result<Downloaded> {
            self.calls.lock().unwrap().push(("download".to_string(), Instant::now()));
            self.downloads
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(IqdbError::http("沒有下載腳本")))
        }
    }
}
