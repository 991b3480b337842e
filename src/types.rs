use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// 結果列的種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    /// Best match
    Best,
    /// Additional match
    Additional,
    /// Possible match
    Possible,
    /// 其他結果（"more results" 區塊或無法辨識的標題）
    Other,
}

/// 內容分級
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    #[default]
    Unrated,
    Safe,
    Questionable,
    Explicit,
}

/// 上游圖庫
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    // 2D (www.iqdb.org)
    Danbooru,
    Konachan,
    Yandere,
    Gelbooru,
    SankakuChannel,
    Eshuushuu,
    TheAnimeGallery,
    Zerochan,
    AnimePictures,
    // 3D (3d.iqdb.org)
    ThreeDbooru,
    IdolComplex,
}

impl Source {
    /// 頁面上顯示的名稱，順序即比對優先序（長名稱在前）
    pub const DISPLAY_NAMES: &'static [(&'static str, Source)] = &[
        ("The Anime Gallery", Source::TheAnimeGallery),
        ("Sankaku Channel", Source::SankakuChannel),
        ("Anime-Pictures", Source::AnimePictures),
        ("Idol Complex", Source::IdolComplex),
        ("e-shuushuu", Source::Eshuushuu),
        ("Danbooru", Source::Danbooru),
        ("Gelbooru", Source::Gelbooru),
        ("Konachan", Source::Konachan),
        ("Zerochan", Source::Zerochan),
        ("yande.re", Source::Yandere),
        ("3dbooru", Source::ThreeDbooru),
    ];

    pub fn display_name(&self) -> &'static str {
        Self::DISPLAY_NAMES
            .iter()
            .find(|(_, source)| source == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }

    /// 從一段文字中找出圖庫名稱：先比對大小寫完全相同者，再退回不分大小寫
    pub fn find_in(text: &str) -> Option<Source> {
        if let Some((_, source)) = Self::DISPLAY_NAMES
            .iter()
            .find(|(name, _)| text.contains(name))
        {
            return Some(*source);
        }

        let lower = text.to_lowercase();
        Self::DISPLAY_NAMES
            .iter()
            .find(|(name, _)| lower.contains(&name.to_lowercase()))
            .map(|(_, source)| *source)
    }
}

/// 圖片解析度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// 寬高必須皆為正數
    pub fn new(width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self { width, height })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}", self.width, self.height)
    }
}

/// 使用者上傳圖片的回顯資訊
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct YourImage {
    pub name: Option<String>,
    pub resolution: Option<Resolution>,
    pub preview_url: Option<String>,
    pub size: Option<String>,
}

/// 單筆比對結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub kind: MatchKind,
    pub target_url: String,
    pub preview_url: Option<String>,
    pub rating: Rating,
    pub score: Option<i64>,
    pub tags: Option<BTreeSet<String>>,
    pub source: Option<Source>,
    pub resolution: Option<Resolution>,
    /// 相似度百分比 0–100
    pub similarity: Option<f64>,
}

impl Match {
    pub fn is_best_match(&self) -> bool {
        self.kind == MatchKind::Best
    }
}

/// 取得更深一頁結果所需的連結
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoreResultsPointer {
    pub href: String,
}

/// 完整的搜尋結果（解析後不再變動）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub searched_image_count: u64,
    /// 搜尋耗時（秒）
    pub searched_duration: f64,
    pub matches: Vec<Match>,
    pub your_image: Option<YourImage>,
    pub more_results_pointer: Option<MoreResultsPointer>,
}

impl SearchResult {
    /// 是否有 best match
    pub fn is_found(&self) -> bool {
        self.matches.iter().any(Match::is_best_match)
    }

    pub fn best_matches(&self) -> Vec<&Match> {
        self.matches_of(MatchKind::Best)
    }

    pub fn additional_matches(&self) -> Vec<&Match> {
        self.matches_of(MatchKind::Additional)
    }

    pub fn possible_matches(&self) -> Vec<&Match> {
        self.matches_of(MatchKind::Possible)
    }

    pub fn other_matches(&self) -> Vec<&Match> {
        self.matches_of(MatchKind::Other)
    }

    fn matches_of(&self, kind: MatchKind) -> Vec<&Match> {
        self.matches.iter().filter(|m| m.kind == kind).collect()
    }
}

/// 伺服器過載排隊中的暫態訊號，不是最終結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// 排隊位置，無法判斷時為 None
    pub position: Option<u32>,
    pub message: String,
    pub raw_html: String,
}
