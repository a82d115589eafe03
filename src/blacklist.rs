pub const DEFAULT_CATEGORY_BLACKLIST: &[&str] = &["by country"];
pub const DEFAULT_ARTICLE_BLACKLIST: &[&str] = &["List of", "Category:", "Template:", "Talk:"];

/// Set of forbidden substrings, matched case-sensitively anywhere in a title.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Blacklist {
    keywords: Vec<String>,
}

impl Blacklist {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Blacklist {
            keywords: keywords.into_iter().map(Into::into).collect(),
        }
    }

    pub fn categories() -> Self {
        Self::new(DEFAULT_CATEGORY_BLACKLIST.iter().copied())
    }

    pub fn articles() -> Self {
        Self::new(DEFAULT_ARTICLE_BLACKLIST.iter().copied())
    }

    pub fn matches(&self, title: &str) -> bool {
        has_blacklist_keywords(title, &self.keywords)
    }
}

pub fn has_blacklist_keywords<S: AsRef<str>>(title: &str, keywords: &[S]) -> bool {
    keywords.iter().any(|k| title.contains(k.as_ref()))
}
