use std::path::Path;
use std::sync::Arc;

use crosspost_core::browser::scripted::{Effect, PageAction, PageScript, ScriptedSessionProvider};
use crosspost_core::browser::{Key, Locator, SessionCookie};
use crosspost_core::{
    DriverSettings, PipelineMetrics, Platform, PublishDriver, PublishError, PublishRequest,
    PublishState,
};
use tempfile::TempDir;

const MEDIUM_TITLE: &str = r#"[data-testid="editorTitleParagraph"]"#;
const MEDIUM_SAVED: &str = "span, div, p";
const MEDIUM_PUBLISH_HEADER: &str = r#"[data-testid="header-publish-button"]"#;
const MEDIUM_TOPICS: &str = r#"[data-testid="publishTopicsInput"]"#;
const MEDIUM_CONFIRM: &str = r#"[data-testid="publishConfirmButton"]"#;

fn settings(dir: &Path) -> DriverSettings {
    let mut settings = DriverSettings::default().with_seed(11);
    settings.capture_dir = dir.join("captures");
    settings
}

fn medium_editor() -> PageScript {
    PageScript::default()
        .with_element(MEDIUM_TITLE, "")
        .with_element(MEDIUM_PUBLISH_HEADER, "Publish")
        .on_click(
            Locator::css(MEDIUM_PUBLISH_HEADER),
            vec![
                Effect::Show {
                    css: ".overlay-dialog".into(),
                    text: String::new(),
                },
                Effect::Show {
                    css: MEDIUM_TOPICS.into(),
                    text: String::new(),
                },
                Effect::Show {
                    css: MEDIUM_CONFIRM.into(),
                    text: "Publish now".into(),
                },
            ],
        )
        .on_click(
            Locator::css(MEDIUM_CONFIRM),
            vec![Effect::Navigate("https://medium.com/@writer/hello-world-5d18830dea37".into())],
        )
}

fn request() -> PublishRequest {
    PublishRequest {
        title: "Hello world".into(),
        content: "First paragraph.\n\nSecond paragraph.".into(),
        tags: vec!["rust".into(), "automation".into()],
        ..PublishRequest::default()
    }
}

struct Harness {
    _dir: TempDir,
    provider: Arc<ScriptedSessionProvider>,
    metrics: Arc<PipelineMetrics>,
    driver: PublishDriver,
}

fn harness(script: PageScript) -> Harness {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedSessionProvider::new(script));
    let metrics = Arc::new(PipelineMetrics::new());
    let driver = PublishDriver::new(provider.clone(), settings(dir.path()), metrics.clone());
    Harness {
        _dir: dir,
        provider,
        metrics,
        driver,
    }
}

#[tokio::test(start_paused = true)]
async fn medium_walks_every_state_and_reports_the_story_url() {
    let h = harness(medium_editor().with_element(MEDIUM_SAVED, "Saved"));
    let cookies = vec![
        SessionCookie::new("uid", "u1", ".medium.com"),
        SessionCookie::new("sid", "s1", ".medium.com"),
    ];
    let receipt = h
        .driver
        .publish(Platform::Medium, &cookies, &request())
        .await
        .unwrap();

    assert_eq!(
        receipt.url.as_deref(),
        Some("https://medium.com/@writer/hello-world-5d18830dea37")
    );
    assert_eq!(receipt.states, PublishState::SEQUENCE.to_vec());

    let actions = h.provider.pages()[0].actions();
    assert_eq!(actions[0], PageAction::SetCookies(cookies));
    assert_eq!(actions[1], PageAction::Goto("https://medium.com/new-story".into()));
    assert!(actions.contains(&PageAction::Clipboard(request().content)));
    assert!(actions.contains(&PageAction::Paste));
    let topics_typed: String = actions
        .iter()
        .skip_while(|action| **action != PageAction::Click(Locator::css(MEDIUM_TOPICS)))
        .filter_map(|action| match action {
            PageAction::Key(Key::Char(ch)) => Some(*ch),
            _ => None,
        })
        .collect();
    assert!(topics_typed.starts_with("rust"));
    assert!(h.provider.pages()[0].is_closed());
    assert_eq!(h.metrics.snapshot().open_pages(), 0);
}

#[tokio::test(start_paused = true)]
async fn unsaved_title_is_a_sync_timeout() {
    let h = harness(medium_editor());
    let started = tokio::time::Instant::now();
    let err = h
        .driver
        .publish(Platform::Medium, &[], &request())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PublishError::SyncTimeout {
            state: PublishState::TitleEntered
        }
    ));
    assert!(err.kind().is_transient());
    assert!(started.elapsed() >= std::time::Duration::from_secs(14));
    assert!(h.provider.pages()[0].is_closed());
}

#[tokio::test(start_paused = true)]
async fn alert_during_save_is_a_waf_block_with_capture() {
    let h = harness(medium_editor().with_element(r#"[role="alert"]"#, "Something went wrong"));
    let err = h
        .driver
        .publish(Platform::Medium, &[], &request())
        .await
        .unwrap_err();

    match &err {
        PublishError::WafBlock { state, detail, capture } => {
            assert_eq!(*state, PublishState::TitleEntered);
            assert_eq!(detail, "Something went wrong");
            let capture = capture.as_ref().expect("capture path");
            assert!(capture.to_string_lossy().contains("medium-title_entered"));
        }
        other => panic!("expected waf block, got {other:?}"),
    }
    assert!(!err.kind().is_transient());
    let actions = h.provider.pages()[0].actions();
    assert!(actions
        .iter()
        .any(|action| matches!(action, PageAction::Screenshot(_))));
}

#[tokio::test(start_paused = true)]
async fn denied_clipboard_falls_back_to_direct_insert() {
    let h = harness(
        medium_editor()
            .with_element(MEDIUM_SAVED, "Saved")
            .deny_clipboard(),
    );
    h.driver
        .publish(Platform::Medium, &[], &request())
        .await
        .unwrap();

    let actions = h.provider.pages()[0].actions();
    assert!(actions.contains(&PageAction::InsertText(request().content)));
    assert!(!actions.contains(&PageAction::Paste));
    let insert = actions
        .iter()
        .position(|action| *action == PageAction::InsertText(request().content))
        .unwrap();
    assert_eq!(actions[insert + 1], PageAction::Key(Key::Char(' ')));
    assert_eq!(actions[insert + 2], PageAction::Key(Key::Backspace));
}

fn devto_editor() -> PageScript {
    PageScript::default()
        .with_element("textarea[placeholder='New post title here...']", "")
        .with_element("#article_body_markdown", "")
        .with_element("#article_tags", "")
        .with_element("button.c-btn.c-btn--primary", "Publish")
}

#[tokio::test(start_paused = true)]
async fn devto_error_toast_after_submit_is_a_waf_block() {
    let h = harness(devto_editor().on_click(
        Locator::with_text("button.c-btn.c-btn--primary", "Publish"),
        vec![Effect::Show {
            css: ".crayons-toast--error".into(),
            text: "Title can't be blank".into(),
        }],
    ));
    let err = h
        .driver
        .publish(Platform::DevTo, &[], &request())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PublishError::WafBlock {
            state: PublishState::PublishRequested,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn devto_silent_submit_times_out_after_sixty_polls() {
    let h = harness(devto_editor());
    let err = h
        .driver
        .publish(Platform::DevTo, &[], &request())
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::PublishTimeout { attempts: 60 }));
    assert_eq!(err.state(), Some(PublishState::PublishRequested));
}

#[tokio::test(start_paused = true)]
async fn devto_cover_is_uploaded_when_input_exists() {
    let dir = TempDir::new().unwrap();
    let cover = dir.path().join("cover.png");
    std::fs::write(&cover, b"png").unwrap();
    let h = harness(
        devto_editor()
            .with_element("#cover-image-input", "")
            .on_click(
                Locator::with_text("button.c-btn.c-btn--primary", "Publish"),
                vec![Effect::Navigate("https://dev.to/writer/hello-world-2b1".into())],
            ),
    );
    let request = PublishRequest {
        cover_file: Some(cover.clone()),
        ..request()
    };
    h.driver
        .publish(Platform::DevTo, &[], &request)
        .await
        .unwrap();
    let actions = h.provider.pages()[0].actions();
    assert!(actions.contains(&PageAction::Upload(Locator::css("#cover-image-input"), cover)));
}

#[tokio::test(start_paused = true)]
async fn linkedin_modal_close_confirms_the_post() {
    let h = harness(
        PageScript::default()
            .with_element("button.share-box-feed-entry__trigger", "Start a post")
            .with_element(r#"div[data-test-ql-editor-contenteditable="true"]"#, "")
            .with_element(".share-box-modal", "")
            .with_element(
                "div.share-box_actions button.share-actions__primary-action",
                "Post",
            )
            .on_click(
                Locator::css("div.share-box_actions button.share-actions__primary-action"),
                vec![Effect::Hide(".share-box-modal".into())],
            ),
    );
    let request = PublishRequest {
        content: "Shipping a new release".into(),
        ..PublishRequest::default()
    };
    let receipt = h
        .driver
        .publish(Platform::LinkedIn, &[], &request)
        .await
        .unwrap();
    assert_eq!(receipt.url, None);
    assert_eq!(receipt.states.last(), Some(&PublishState::PublishConfirmed));
}
