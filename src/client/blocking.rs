use super::config::ClientConfig;
use super::engine::{CancelHandle, SearchClient, SearchInfo};
use crate::error::{IqdbError, Result};
use crate::fetcher::HttpTransport;
use crate::normalizer::ImageInput;
use crate::types::SearchResult;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

/// 同步版搜尋客戶端
///
/// 自帶 current-thread runtime，語意與 [`SearchClient`] 相同。
/// 不可在 async context 裡呼叫（會 panic）。
pub struct BlockingSearchClient {
    runtime: Runtime,
    inner: SearchClient,
}

impl BlockingSearchClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let runtime = build_runtime()?;
        let inner = {
            let _guard = runtime.enter();
            SearchClient::new(config)?
        };
        Ok(Self { runtime, inner })
    }

    pub fn with_transport(config: ClientConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        Ok(Self {
            runtime: build_runtime()?,
            inner: SearchClient::with_transport(config, transport)?,
        })
    }

    pub fn search_by_url(&self, url: &str, force_download: Option<bool>) -> Result<SearchResult> {
        self.runtime.block_on(self.inner.search_by_url(url, force_download))
    }

    pub fn search_by_file(&self, input: impl Into<ImageInput>) -> Result<SearchResult> {
        self.runtime.block_on(self.inner.search_by_file(input))
    }

    pub fn fetch_more_results(&self, result: SearchResult) -> SearchResult {
        self.runtime.block_on(self.inner.fetch_more_results(result))
    }

    pub fn search_info(&self) -> SearchInfo {
        self.inner.search_info()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.inner.cancel_handle()
    }
}

fn build_runtime() -> Result<Runtime> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| IqdbError::http("無法建立 tokio runtime").caused_by(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::fetcher::mock::ScriptedTransport;
    use std::time::Duration;

    const BEST_PAGE: &str = r#"<html><body><div id="pages">
        <div><table><tr><th>Best match</th></tr>
        <tr><td><a href="//danbooru.donmai.us/posts/7"><img src="/t/7.jpg"></a></td></tr>
        <tr><td>Danbooru</td></tr></table></div>
        </div><p>Searched 10 images in 0.1 seconds.</p></body></html>"#;

    fn client(transport: ScriptedTransport) -> BlockingSearchClient {
        let config = ClientConfig::default()
            .with_rate_limit(Duration::ZERO)
            .with_prevent_bans(false);
        BlockingSearchClient::with_transport(config, Arc::new(transport)).unwrap()
    }

    #[test]
    fn test_blocking_search_by_url() {
        let client = client(ScriptedTransport::new().reply(Ok(BEST_PAGE.to_string())));
        let result = client.search_by_url("https://example.com/a.jpg", None).unwrap();

        assert_eq!(result.searched_image_count, 10);
        assert_eq!(result.matches[0].target_url, "https://danbooru.donmai.us/posts/7");
    }

    #[test]
    fn test_blocking_errors_match_async() {
        let client = client(ScriptedTransport::new());
        let err = client.search_by_url("", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = client.search_by_file(b"not an image".to_vec()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);
    }

    #[test]
    fn test_blocking_cancel() {
        let client = client(ScriptedTransport::new().reply(Ok(BEST_PAGE.to_string())));
        client.cancel_handle().cancel();

        let err = client.search_by_url("https://example.com/a.jpg", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserCancelled);
    }

    #[test]
    fn test_blocking_new_with_real_transport() {
        let client = BlockingSearchClient::new(ClientConfig::three_d()).unwrap();
        assert_eq!(client.search_info().base_url, "https://3d.iqdb.org");
    }
}
