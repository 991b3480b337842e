use crate::normalizer::MAX_FILE_SIZE;
use crate::types::Source;
use std::env;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// 防封鎖模式輪替使用的 User-Agent
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
];

/// `service` 參數：要求所有圖庫（擴充結果）
const EXTENDED_SERVICES: &str = "1,2,3,4,5,6,7,8,9,10,11,12,13";

/// 開啟除錯輸出的環境變數
pub const DEBUG_ENV: &str = "IQDB_DEBUG";

const DISCORD_MEDIA_HOSTS: &[&str] = &["cdn.discordapp.com", "media.discordapp.net"];

/// 影響請求參數的選項
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadOptions {
    /// 忽略顏色 (`forcegray=1`)
    pub ignore_colors: bool,
    /// 要求擴充結果 (`service=...`)
    pub search_more: bool,
}

/// 依服務產生請求欄位：`(options, is_upload) -> fields`
pub type PayloadStrategy = fn(&PayloadOptions, bool) -> Vec<(String, String)>;

/// 決定 URL 搜尋時是否先下載圖片
pub type DownloadPolicy = fn(&str) -> bool;

/// 服務設定（2D / 3D 的差異都在這裡）
#[derive(Debug, Clone)]
pub struct ServiceProfile {
    pub name: &'static str,
    pub base_url: String,
    pub sources: &'static [Source],
    /// 上傳時額外帶的 headers
    pub upload_headers: Vec<(String, String)>,
    pub payload: PayloadStrategy,
}

impl ServiceProfile {
    /// www.iqdb.org（動漫圖庫）
    pub fn iqdb() -> Self {
        Self {
            name: "iqdb",
            base_url: "https://www.iqdb.org".to_string(),
            sources: &[
                Source::Danbooru,
                Source::Konachan,
                Source::Yandere,
                Source::Gelbooru,
                Source::SankakuChannel,
                Source::Eshuushuu,
                Source::TheAnimeGallery,
                Source::Zerochan,
                Source::AnimePictures,
            ],
            upload_headers: Vec::new(),
            payload: standard_payload,
        }
    }

    /// 3d.iqdb.org（cosplay / 真人）
    pub fn iqdb_3d() -> Self {
        Self {
            name: "iqdb-3d",
            base_url: "https://3d.iqdb.org".to_string(),
            sources: &[Source::ThreeDbooru, Source::IdolComplex],
            upload_headers: vec![("Origin".to_string(), "https://3d.iqdb.org".to_string())],
            payload: three_d_payload,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn prepare_search_payload(&self, options: &PayloadOptions, is_upload: bool) -> Vec<(String, String)> {
        (self.payload)(options, is_upload)
    }

    pub fn supported_sources(&self) -> Vec<&'static str> {
        self.sources.iter().map(Source::display_name).collect()
    }

    /// 搜尋端點
    pub fn endpoint(&self) -> String {
        format!("{}/", self.base_url)
    }
}

fn standard_payload(options: &PayloadOptions, _is_upload: bool) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    if options.ignore_colors {
        fields.push(("forcegray".to_string(), "1".to_string()));
    }
    if options.search_more {
        fields.push(("service".to_string(), EXTENDED_SERVICES.to_string()));
    }
    fields
}

/// 3D 上傳表單需要 MAX_FILE_SIZE 與空的 url 欄位
fn three_d_payload(options: &PayloadOptions, is_upload: bool) -> Vec<(String, String)> {
    let mut fields = standard_payload(options, is_upload);
    if is_upload {
        fields.push(("MAX_FILE_SIZE".to_string(), MAX_FILE_SIZE.to_string()));
        fields.push(("url".to_string(), String::new()));
    }
    fields
}

/// 預設一律直接送 URL
pub fn never_download(_url: &str) -> bool {
    false
}

pub fn is_discord_media_url(url: &str) -> bool {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| DISCORD_MEDIA_HOSTS.contains(&h)))
        .unwrap_or(false)
}

/// 客戶端配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub profile: ServiceProfile,
    /// 兩次請求的最小間隔
    pub rate_limit: Duration,
    /// 請求超時，None 為不限
    pub timeout: Option<Duration>,
    pub user_agent: String,
    pub ignore_colors: bool,
    pub search_more: bool,
    /// 隨機延遲 + User-Agent 輪替
    pub prevent_bans: bool,
    /// 暫態錯誤最多重試次數（總嘗試次數 = max_retries + 1）
    pub max_retries: u32,
    /// 重試前基本等待時間（另加 0–1 秒隨機）
    pub retry_delay: Duration,
    /// 搜尋成功後自動抓取「更多結果」
    pub include_more_results: bool,
    pub debug: bool,
    pub download_policy: DownloadPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            profile: ServiceProfile::iqdb(),
            rate_limit: Duration::from_millis(5100),
            timeout: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            ignore_colors: false,
            search_more: false,
            prevent_bans: true,
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            include_more_results: false,
            debug: false,
            download_policy: never_download,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 3d.iqdb.org 的預設配置
    pub fn three_d() -> Self {
        Self::default().with_profile(ServiceProfile::iqdb_3d())
    }

    pub fn with_profile(mut self, profile: ServiceProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.profile = self.profile.with_base_url(base_url);
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: Duration) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn with_ignore_colors(mut self, ignore_colors: bool) -> Self {
        self.ignore_colors = ignore_colors;
        self
    }

    pub fn with_search_more(mut self, search_more: bool) -> Self {
        self.search_more = search_more;
        self
    }

    pub fn with_prevent_bans(mut self, prevent_bans: bool) -> Self {
        self.prevent_bans = prevent_bans;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_include_more_results(mut self, include: bool) -> Self {
        self.include_more_results = include;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_download_policy(mut self, policy: DownloadPolicy) -> Self {
        self.download_policy = policy;
        self
    }

    pub fn payload_options(&self) -> PayloadOptions {
        PayloadOptions {
            ignore_colors: self.ignore_colors,
            search_more: self.search_more,
        }
    }

    /// 設定值或 `IQDB_DEBUG=1`
    pub fn debug_enabled(&self) -> bool {
        self.debug || env::var(DEBUG_ENV).is_ok_and(|v| v == "1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.profile.base_url, "https://www.iqdb.org");
        assert_eq!(config.rate_limit, Duration::from_millis(5100));
        assert!(!config.ignore_colors);
        assert!(!config.search_more);
        assert!(config.prevent_bans);
        assert!(!(config.download_policy)("https://example.com/a.jpg"));
    }

    #[test]
    fn test_payload_defaults_are_empty() {
        let config = ClientConfig::default();
        let fields = config.profile.prepare_search_payload(&config.payload_options(), false);
        assert!(fields.is_empty());
    }

    #[test]
    fn test_payload_with_options() {
        let config = ClientConfig::default().with_ignore_colors(true).with_search_more(true);
        let fields = config.profile.prepare_search_payload(&config.payload_options(), true);

        assert!(fields.contains(&("forcegray".to_string(), "1".to_string())));
        assert!(fields.contains(&("service".to_string(), EXTENDED_SERVICES.to_string())));
        assert!(!fields.iter().any(|(k, _)| k == "MAX_FILE_SIZE"));
    }

    #[test]
    fn test_three_d_upload_adds_fixed_fields() {
        let profile = ServiceProfile::iqdb_3d();
        let options = PayloadOptions::default();

        let upload = profile.prepare_search_payload(&options, true);
        assert!(upload.contains(&("MAX_FILE_SIZE".to_string(), "8388608".to_string())));
        assert!(upload.contains(&("url".to_string(), String::new())));

        let get = profile.prepare_search_payload(&options, false);
        assert!(get.is_empty());
    }

    #[test]
    fn test_supported_sources() {
        let sources = ServiceProfile::iqdb().supported_sources();
        assert!(sources.contains(&"Danbooru"));
        assert!(sources.contains(&"Gelbooru"));
        assert!(sources.contains(&"Konachan"));

        let sources = ServiceProfile::iqdb_3d().supported_sources();
        assert_eq!(sources, vec!["3dbooru", "Idol Complex"]);
    }

    #[test]
    fn test_is_discord_media_url() {
        assert!(is_discord_media_url("https://cdn.discordapp.com/attachments/1/2/a.jpg"));
        assert!(is_discord_media_url("https://media.discordapp.net/attachments/1/2/a.png"));
        assert!(!is_discord_media_url("https://example.com/a.jpg"));
        assert!(!is_discord_media_url("not a url"));
    }

    #[test]
    fn test_base_url_is_trimmed() {
        let config = ClientConfig::default().with_base_url("http://localhost:8080/");
        assert_eq!(config.profile.endpoint(), "http://localhost:8080/");
    }
}
