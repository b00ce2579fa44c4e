use std::fmt;

use serde::{Deserialize, Serialize};

/// Publish protocol states in the order a driver walks through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishState {
    Init,
    SessionInjected,
    EditorReady,
    TitleEntered,
    TitleConfirmed,
    BodyEntered,
    BodyConfirmed,
    MetadataApplied,
    PublishRequested,
    PublishConfirmed,
}

impl PublishState {
    pub const SEQUENCE: [PublishState; 10] = [
        PublishState::Init,
        PublishState::SessionInjected,
        PublishState::EditorReady,
        PublishState::TitleEntered,
        PublishState::TitleConfirmed,
        PublishState::BodyEntered,
        PublishState::BodyConfirmed,
        PublishState::MetadataApplied,
        PublishState::PublishRequested,
        PublishState::PublishConfirmed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PublishState::Init => "init",
            PublishState::SessionInjected => "session_injected",
            PublishState::EditorReady => "editor_ready",
            PublishState::TitleEntered => "title_entered",
            PublishState::TitleConfirmed => "title_confirmed",
            PublishState::BodyEntered => "body_entered",
            PublishState::BodyConfirmed => "body_confirmed",
            PublishState::MetadataApplied => "metadata_applied",
            PublishState::PublishRequested => "publish_requested",
            PublishState::PublishConfirmed => "publish_confirmed",
        }
    }
}

impl fmt::Display for PublishState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
