use std::sync::Arc;

use crosspost_core::browser::scripted::{Effect, PageScript, ScriptedSessionProvider};
use crosspost_core::browser::Locator;
use crosspost_core::config::BreakerSection;
use crosspost_core::{
    BreakerRegistry, CircuitState, CredentialResolver, DriverSettings, EnvFallback, FailureKind,
    FailureLedger, MessageHandler, PipelineMetrics, Platform, PublishChannel, PublishDriver,
    PublishError, PublishService, PublishTask, SqliteCredentialStore,
};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const GUARD: &str = "])}while(1);</x>";
const MEDIUM_CREDENTIALS: &[(&str, &str)] = &[("MEDIUM_UID", "u"), ("MEDIUM_SID", "s")];

fn medium_editor() -> PageScript {
    let publish = r#"[data-testid="header-publish-button"]"#;
    let confirm = r#"[data-testid="publishConfirmButton"]"#;
    PageScript::default()
        .with_element(r#"[data-testid="editorTitleParagraph"]"#, "")
        .with_element(publish, "Publish")
        .on_click(
            Locator::css(publish),
            vec![
                Effect::Show {
                    css: ".overlay-dialog".into(),
                    text: String::new(),
                },
                Effect::Show {
                    css: r#"[data-testid="publishTopicsInput"]"#.into(),
                    text: String::new(),
                },
                Effect::Show {
                    css: confirm.into(),
                    text: "Publish now".into(),
                },
            ],
        )
        .on_click(
            Locator::css(confirm),
            vec![Effect::Navigate("https://medium.com/@team/release-notes-9f2".into())],
        )
}

struct Fixture {
    dir: TempDir,
    provider: Arc<ScriptedSessionProvider>,
    metrics: Arc<PipelineMetrics>,
    ledger: Arc<FailureLedger>,
    service: PublishService,
}

fn fixture(script: PageScript, env: &[(&str, &str)]) -> Fixture {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedSessionProvider::new(script));
    let metrics = Arc::new(PipelineMetrics::new());
    let store = Arc::new(SqliteCredentialStore::open(dir.path().join("credentials.sqlite")).unwrap());
    let resolver = CredentialResolver::new(store, EnvFallback::from_pairs(env.iter().copied()));
    let mut settings = DriverSettings::default().with_seed(3);
    settings.capture_dir = dir.path().join("captures");
    let driver = Arc::new(PublishDriver::new(provider.clone(), settings, metrics.clone()));
    let breakers = Arc::new(BreakerRegistry::new(&BreakerSection::default()));
    let ledger = Arc::new(
        FailureLedger::new(
            dir.path().join("failures.jsonl"),
            dir.path().join("ledger.sqlite"),
        )
        .unwrap(),
    );
    let service = PublishService::new(resolver, breakers, driver, metrics.clone())
        .with_ledger(ledger.clone());
    Fixture {
        dir,
        provider,
        metrics,
        ledger,
        service,
    }
}

fn task(platform: Platform) -> PublishTask {
    PublishTask {
        user_id: 42,
        platform,
        title: "Release notes".into(),
        content: "We shipped.\n\nDetails follow.".into(),
        cover_image: None,
        tags: vec!["release".into()],
        blog_url: None,
    }
}

#[tokio::test(start_paused = true)]
async fn missing_credentials_never_reach_the_breaker_or_browser() {
    let f = fixture(PageScript::default(), &[]);
    let err = f.service.run(&task(Platform::DevTo), 0).await.unwrap_err();

    assert!(matches!(
        err,
        PublishError::CredentialsMissing {
            platform: Platform::DevTo,
            user_id: 42
        }
    ));
    let breaker = f.service.breakers().get(Platform::DevTo);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
    assert_eq!(f.provider.pages_opened(), 0);

    let failures = f.ledger.recent_failures(Some(Platform::DevTo), 10).unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, FailureKind::CredentialsMissing);
}

#[tokio::test(start_paused = true)]
async fn repeated_crashes_open_the_platform_breaker() {
    let f = fixture(
        PageScript::default().crash_on_goto(),
        &[("DEVTO_SESSION_TOKEN", "tok")],
    );
    for retry in 0..3 {
        let err = f.service.run(&task(Platform::DevTo), retry).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::BrowserCrashed);
    }
    let breaker = f.service.breakers().get(Platform::DevTo);
    assert_eq!(breaker.state(), CircuitState::Open);

    let err = f.service.run(&task(Platform::DevTo), 0).await.unwrap_err();
    assert!(matches!(err, PublishError::CircuitOpen(_)));
    assert_eq!(f.provider.pages_opened(), 3);
    assert_eq!(
        f.service.breakers().get(Platform::Medium).state(),
        CircuitState::Closed
    );

    let failures = f.ledger.recent_failures(Some(Platform::DevTo), 10).unwrap();
    assert_eq!(failures.len(), 4);
    let crashed = failures
        .iter()
        .filter(|failure| failure.kind == FailureKind::BrowserCrashed)
        .count();
    assert_eq!(crashed, 3);
    assert!(failures.iter().any(|failure| failure.kind == FailureKind::CircuitOpen));

    let log = std::fs::read_to_string(f.dir.path().join("failures.jsonl")).unwrap();
    assert_eq!(log.lines().count(), 4);
    assert_eq!(f.metrics.snapshot().total_failed(), 4);
}

#[tokio::test(start_paused = true)]
async fn browser_publish_records_a_breaker_success() {
    let f = fixture(
        medium_editor().with_element("span, div, p", "Saved"),
        MEDIUM_CREDENTIALS,
    );
    let breaker = f.service.breakers().get(Platform::Medium);
    breaker.record_failure();
    assert_eq!(breaker.failure_count(), 1);

    let published = f.service.run(&task(Platform::Medium), 0).await.unwrap();

    assert_eq!(published.channel, PublishChannel::Browser);
    assert_eq!(
        published.url.as_deref(),
        Some("https://medium.com/@team/release-notes-9f2")
    );
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
    assert_eq!(f.provider.pages_opened(), 1);
    assert!(f.provider.pages()[0].is_closed());
    assert_eq!(f.ledger.run_count(Platform::Medium).unwrap(), 1);
    assert!(f
        .ledger
        .recent_failures(Some(Platform::Medium), 10)
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn unsaved_title_records_one_breaker_failure() {
    let f = fixture(medium_editor(), MEDIUM_CREDENTIALS);
    let err = f.service.run(&task(Platform::Medium), 0).await.unwrap_err();

    assert_eq!(err.kind(), FailureKind::SyncTimeout);
    let breaker = f.service.breakers().get(Platform::Medium);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 1);

    let failures = f.ledger.recent_failures(Some(Platform::Medium), 10).unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, FailureKind::SyncTimeout);
    assert!(f.provider.pages()[0].is_closed());
}

#[tokio::test]
async fn medium_api_publishes_without_opening_a_page() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/new-story"))
        .and(header("x-obvious-cid", "web"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(format!(r#"{GUARD}{{"payload":{{"value":{{"id":"abc123"}}}}}}"#)),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/p/abc123/deltas"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!("{GUARD}{{}}")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/_/api/posts/abc123/metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!("{GUARD}{{}}")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/p/abc123/publish"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            r#"{GUARD}{{"payload":{{"value":{{"mediumUrl":"https://medium.com/@team/release-notes-abc123"}}}}}}"#
        )))
        .expect(1)
        .mount(&server)
        .await;

    let f = fixture(PageScript::default(), MEDIUM_CREDENTIALS);
    let service = f.service.with_medium_api(server.uri());
    let published = service.run(&task(Platform::Medium), 0).await.unwrap();

    assert_eq!(published.channel, PublishChannel::Api);
    assert_eq!(
        published.url.as_deref(),
        Some("https://medium.com/@team/release-notes-abc123")
    );
    assert_eq!(f.provider.pages_opened(), 0);
    let snapshot = f.metrics.snapshot();
    assert_eq!(snapshot.api_publishes, 1);
    assert_eq!(snapshot.browser_fallbacks, 0);
    assert_eq!(f.ledger.run_count(Platform::Medium).unwrap(), 1);
}

#[tokio::test]
async fn medium_api_error_falls_back_to_the_browser() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/new-story"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
        .expect(1)
        .mount(&server)
        .await;

    let f = fixture(PageScript::default().crash_on_goto(), MEDIUM_CREDENTIALS);
    let service = f.service.with_medium_api(server.uri());
    let err = service.run(&task(Platform::Medium), 1).await.unwrap_err();

    assert_eq!(err.kind(), FailureKind::BrowserCrashed);
    assert_eq!(f.provider.pages_opened(), 1);
    let snapshot = f.metrics.snapshot();
    assert_eq!(snapshot.api_publishes, 0);
    assert_eq!(snapshot.browser_fallbacks, 1);

    let failures = f.ledger.recent_failures(Some(Platform::Medium), 10).unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].retry_count, 1);
}

#[tokio::test]
async fn undecodable_message_is_an_invalid_task() {
    let f = fixture(PageScript::default(), &[]);
    let err = f.service.handle(b"{not json").await.unwrap_err();

    assert!(err.to_string().starts_with("invalid task"));
    assert_eq!(f.metrics.snapshot().total_failed(), 1);
    assert_eq!(f.provider.pages_opened(), 0);
}
