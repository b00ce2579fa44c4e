use std::time::Duration;

use crate::browser::Locator;
use crate::platform::Platform;

/// How text reaches an editor field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryMode {
    /// Human-cadence keystrokes into the focused field.
    HumanType,
    /// Replace the field value in one step.
    Fill,
    /// Clipboard write plus paste shortcut, falling back to direct insertion.
    ClipboardPaste,
}

/// What proves the server accepted an edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// Poll for the platform's autosave indicator.
    SaveIndicator,
    /// The editor keeps everything client-side until submit.
    Immediate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    /// Element to focus first; `None` continues at the caret.
    pub target: Option<Locator>,
    pub entry: EntryMode,
    pub confirm: Confirmation,
    /// Start a new paragraph once the field is confirmed.
    pub trailing_enter: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveIndicator {
    pub saved: Locator,
    pub error: Locator,
}

/// Gesture that commits a tag. The two are not interchangeable: Enter in a
/// Dev.to tag box submits the whole form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagGesture {
    Enter,
    Blur,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataSpec {
    /// Clicked (first present wins) to reveal the tag panel.
    pub panel_openers: Vec<Locator>,
    pub panel: Option<Locator>,
    pub tag_inputs: Vec<Locator>,
    pub gesture: TagGesture,
    pub default_tag: Option<String>,
    pub max_tags: usize,
    /// Missing tag input fails the attempt instead of being skipped.
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverUpload {
    /// Each step clicks the first present candidate.
    pub steps: Vec<Vec<Locator>>,
    pub file_inputs: Vec<Locator>,
    pub settle: Duration,
    pub trailing_enter: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkAppend {
    pub pause_ms: [u32; 2],
    pub preview_wait: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishConfirmation {
    /// The composer URL changes, or an explicit success element shows up.
    NavigatedAway {
        success: Option<Locator>,
        error: Option<Locator>,
    },
    /// The compose modal disappears.
    ModalClosed(Locator),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCookieSpec {
    pub domain: &'static str,
    pub same_site_lax: bool,
}

impl SessionCookieSpec {
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Medium => Self {
                domain: ".medium.com",
                same_site_lax: false,
            },
            Platform::DevTo => Self {
                domain: "dev.to",
                same_site_lax: true,
            },
            Platform::LinkedIn => Self {
                domain: ".linkedin.com",
                same_site_lax: false,
            },
        }
    }
}

/// Everything that differs between platforms; the protocol itself lives in
/// the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformProfile {
    pub platform: Platform,
    pub cookies: SessionCookieSpec,
    pub composer_url: String,
    pub login_urls: Vec<String>,
    pub reading_pause_ms: [u32; 2],
    pub open_composer: Vec<Locator>,
    pub editor_ready: Locator,
    pub title: Option<FieldSpec>,
    pub cover: Option<CoverUpload>,
    pub body: FieldSpec,
    pub link: Option<LinkAppend>,
    pub save_indicator: Option<SaveIndicator>,
    pub metadata: Option<MetadataSpec>,
    pub submit: Vec<Locator>,
    pub submit_must_be_enabled: bool,
    pub publish: PublishConfirmation,
    pub publish_interval: Duration,
}

impl PlatformProfile {
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Medium => medium(),
            Platform::DevTo => devto(),
            Platform::LinkedIn => linkedin(),
        }
    }

    pub fn is_login_url(&self, url: &str) -> bool {
        self.login_urls.iter().any(|login| url.starts_with(login.as_str()))
    }
}

fn medium() -> PlatformProfile {
    let title = Locator::css(r#"[data-testid="editorTitleParagraph"]"#);
    PlatformProfile {
        platform: Platform::Medium,
        cookies: SessionCookieSpec::for_platform(Platform::Medium),
        composer_url: "https://medium.com/new-story".into(),
        login_urls: vec![
            "https://medium.com/m/signin".into(),
            "https://medium.com/ap/signin".into(),
            "https://medium.com/signin".into(),
        ],
        reading_pause_ms: [500, 1200],
        open_composer: Vec::new(),
        editor_ready: title.clone(),
        title: Some(FieldSpec {
            target: Some(title),
            entry: EntryMode::HumanType,
            confirm: Confirmation::SaveIndicator,
            trailing_enter: true,
        }),
        cover: Some(CoverUpload {
            steps: vec![
                vec![
                    Locator::css(r#"[data-testid="editorAddButton"]"#),
                    Locator::css(r#"button[data-action="inline-menu"]"#),
                ],
                vec![
                    Locator::css(r#"button[data-action="inline-menu-image"]"#),
                    Locator::with_text("button", "Add an image"),
                ],
            ],
            file_inputs: vec![Locator::css(r#"input[type="file"]"#)],
            settle: Duration::from_secs(2),
            trailing_enter: true,
        }),
        body: FieldSpec {
            target: None,
            entry: EntryMode::ClipboardPaste,
            confirm: Confirmation::SaveIndicator,
            trailing_enter: false,
        },
        link: None,
        save_indicator: Some(SaveIndicator {
            saved: Locator::with_text("span, div, p", "Saved"),
            error: Locator::css(r#"[role="alert"]"#),
        }),
        metadata: Some(MetadataSpec {
            panel_openers: vec![
                Locator::css(r#"[data-action="show-prepublish"]"#),
                Locator::css(r#"[data-testid="header-publish-button"]"#),
                Locator::with_text("button", "Publish"),
            ],
            panel: Some(Locator::css(".overlay-dialog")),
            tag_inputs: vec![Locator::css(r#"[data-testid="publishTopicsInput"]"#)],
            gesture: TagGesture::Enter,
            default_tag: None,
            max_tags: 5,
            required: false,
        }),
        submit: vec![
            Locator::css(r#"[data-testid="publishConfirmButton"]"#),
            Locator::with_text("button", "Publish now"),
        ],
        submit_must_be_enabled: false,
        publish: PublishConfirmation::NavigatedAway {
            success: None,
            error: None,
        },
        publish_interval: Duration::from_secs(1),
    }
}

fn devto() -> PlatformProfile {
    let title = Locator::css("textarea[placeholder='New post title here...']");
    PlatformProfile {
        platform: Platform::DevTo,
        cookies: SessionCookieSpec::for_platform(Platform::DevTo),
        composer_url: "https://dev.to/new".into(),
        login_urls: vec!["https://dev.to/enter".into()],
        reading_pause_ms: [500, 1200],
        open_composer: Vec::new(),
        editor_ready: title.clone(),
        title: Some(FieldSpec {
            target: Some(title),
            entry: EntryMode::Fill,
            confirm: Confirmation::Immediate,
            trailing_enter: false,
        }),
        cover: Some(CoverUpload {
            steps: Vec::new(),
            file_inputs: vec![
                Locator::css("#cover-image-input"),
                Locator::css(r#"[data-testid="cover-image-input"]"#),
            ],
            settle: Duration::from_millis(700),
            trailing_enter: false,
        }),
        body: FieldSpec {
            target: Some(Locator::css("#article_body_markdown")),
            entry: EntryMode::Fill,
            confirm: Confirmation::Immediate,
            trailing_enter: false,
        },
        link: None,
        save_indicator: None,
        metadata: Some(MetadataSpec {
            panel_openers: Vec::new(),
            panel: None,
            tag_inputs: vec![
                Locator::css("#article_tags"),
                Locator::css("input[placeholder*='tags']"),
            ],
            gesture: TagGesture::Blur,
            default_tag: Some("automation".into()),
            max_tags: 4,
            required: true,
        }),
        submit: vec![Locator::with_text("button.c-btn.c-btn--primary", "Publish")],
        submit_must_be_enabled: false,
        publish: PublishConfirmation::NavigatedAway {
            success: Some(Locator::with_text("button", "Saved")),
            error: Some(Locator::css(".crayons-toast--error")),
        },
        publish_interval: Duration::from_millis(500),
    }
}

fn linkedin() -> PlatformProfile {
    let editor = Locator::css(r#"div[data-test-ql-editor-contenteditable="true"]"#);
    PlatformProfile {
        platform: Platform::LinkedIn,
        cookies: SessionCookieSpec::for_platform(Platform::LinkedIn),
        composer_url: "https://www.linkedin.com/feed/".into(),
        login_urls: vec![
            "https://www.linkedin.com/login".into(),
            "https://www.linkedin.com/authwall".into(),
            "https://www.linkedin.com/uas/login".into(),
            "https://www.linkedin.com/checkpoint".into(),
        ],
        reading_pause_ms: [4000, 6000],
        open_composer: vec![
            Locator::css("button.share-box-feed-entry__trigger"),
            Locator::with_text("span", "Start a post"),
        ],
        editor_ready: editor.clone(),
        title: None,
        cover: None,
        body: FieldSpec {
            target: Some(editor),
            entry: EntryMode::HumanType,
            confirm: Confirmation::Immediate,
            trailing_enter: false,
        },
        link: Some(LinkAppend {
            pause_ms: [1000, 1500],
            preview_wait: Duration::from_secs(8),
        }),
        save_indicator: None,
        metadata: None,
        submit: vec![
            Locator::css("div.share-box_actions button.share-actions__primary-action"),
            Locator::with_text("button", "Post"),
        ],
        submit_must_be_enabled: true,
        publish: PublishConfirmation::ModalClosed(Locator::css(".share-box-modal")),
        publish_interval: Duration::from_secs(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_gestures_differ_between_blog_platforms() {
        let medium = PlatformProfile::for_platform(Platform::Medium);
        let devto = PlatformProfile::for_platform(Platform::DevTo);
        assert_eq!(medium.metadata.unwrap().gesture, TagGesture::Enter);
        assert_eq!(devto.metadata.unwrap().gesture, TagGesture::Blur);
    }

    #[test]
    fn login_urls_match_by_prefix() {
        let devto = PlatformProfile::for_platform(Platform::DevTo);
        assert!(devto.is_login_url("https://dev.to/enter?signup=true"));
        assert!(!devto.is_login_url("https://dev.to/new"));
    }

    #[test]
    fn linkedin_has_no_title_field() {
        let linkedin = PlatformProfile::for_platform(Platform::LinkedIn);
        assert!(linkedin.title.is_none());
        assert!(linkedin.submit_must_be_enabled);
    }
}
