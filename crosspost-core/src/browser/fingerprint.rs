use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::page::Page;

use crate::config::BrowserSection;

use super::error::{BrowserError, BrowserResult};

/// Scripts installed before any document loads so the automation surface
/// looks like an ordinary desktop Chrome.
#[derive(Debug, Clone)]
pub struct FingerprintMasker {
    user_agent: String,
    lang: Option<String>,
    webgl_vendor: String,
    webgl_renderer: String,
}

impl FingerprintMasker {
    pub fn new(section: &BrowserSection) -> Self {
        Self {
            user_agent: section.user_agent.clone(),
            lang: section.lang.clone(),
            webgl_vendor: "Intel Inc.".into(),
            webgl_renderer: "Intel Iris OpenGL Engine".into(),
        }
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub async fn apply(&self, page: &Page) -> BrowserResult<()> {
        page.enable_stealth_mode_with_agent(&self.user_agent).await?;
        for script in self.scripts() {
            page.evaluate_on_new_document(
                AddScriptToEvaluateOnNewDocumentParams::builder()
                    .source(script)
                    .build()
                    .map_err(BrowserError::Configuration)?,
            )
            .await?;
        }
        Ok(())
    }

    pub fn scripts(&self) -> Vec<String> {
        let mut scripts = vec![
            "Object.defineProperty(navigator, 'webdriver', { get: () => undefined });".to_string(),
            self.webgl_script(),
        ];
        if let Some(lang) = &self.lang {
            scripts.push(format!(
                "Object.defineProperty(navigator, 'language', {{ get: () => '{lang}' }});\nObject.defineProperty(navigator, 'languages', {{ get: () => ['{lang}', 'en'] }});"
            ));
        }
        scripts
    }

    fn webgl_script(&self) -> String {
        let vendor = &self.webgl_vendor;
        let renderer = &self.webgl_renderer;
        format!(
            r#"
            (() => {{
                const spoofParam = (proto) => {{
                    if (!proto || !proto.getParameter) {{
                        return;
                    }}
                    const original = proto.getParameter;
                    proto.getParameter = function(param) {{
                        if (param === 37445) {{
                            return '{vendor}';
                        }}
                        if (param === 37446) {{
                            return '{renderer}';
                        }}
                        return original.apply(this, arguments);
                    }};
                }};
                spoofParam(window.WebGLRenderingContext && WebGLRenderingContext.prototype);
                spoofParam(window.WebGL2RenderingContext && WebGL2RenderingContext.prototype);
            }})();
            "#
        )
    }
}
