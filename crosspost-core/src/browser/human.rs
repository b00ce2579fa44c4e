use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::time::sleep;

use crate::config::HumanSection;

use super::error::BrowserResult;
use super::session::{Key, Locator, PageSession};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Keystroke {
    pub key: Key,
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MouseStep {
    pub point: Point,
    pub delay: Duration,
}

/// Randomised pointer and keyboard cadence. One instance per task attempt;
/// it remembers where the pointer was left.
#[derive(Debug)]
pub struct HumanSimulator {
    config: HumanSection,
    last_point: Option<Point>,
    rng: ChaCha8Rng,
}

impl HumanSimulator {
    pub fn new(config: HumanSection) -> Self {
        Self {
            config,
            last_point: None,
            rng: ChaCha8Rng::from_entropy(),
        }
    }

    pub fn with_seed(config: HumanSection, seed: u64) -> Self {
        Self {
            config,
            last_point: None,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Scroll into view, settle, glide the pointer over the target, react, click.
    pub async fn click(&mut self, page: &dyn PageSession, target: &Locator) -> BrowserResult<()> {
        page.scroll_into_view(target).await?;
        let settle = self.random_duration(self.config.scroll_settle_ms);
        sleep(settle).await;

        let bbox = page.element_box(target).await?;
        let jitter = f64::from(self.config.mouse_jitter_px);
        let aim = Point::new(
            bbox.x + self.rng.gen_range(0.3..0.7) * bbox.width + self.random_offset(jitter),
            bbox.y + self.rng.gen_range(0.3..0.7) * bbox.height + self.random_offset(jitter),
        );
        for step in self.plan_motion(aim) {
            page.move_mouse(step.point.x, step.point.y).await?;
            sleep(step.delay).await;
        }
        self.last_point = Some(aim);

        let reaction = self.random_duration(self.config.reaction_ms);
        sleep(reaction).await;
        page.click(target).await
    }

    /// Types into the focused element one key at a time, then nudges the
    /// page with a space/backspace pair.
    pub async fn type_text(&mut self, page: &dyn PageSession, text: &str) -> BrowserResult<()> {
        for stroke in self.plan_keystrokes(text) {
            page.press_key(stroke.key).await?;
            sleep(stroke.delay).await;
        }
        self.nudge(page).await
    }

    /// Forces reactive editors to notice programmatic input.
    pub async fn nudge(&mut self, page: &dyn PageSession) -> BrowserResult<()> {
        page.press_key(Key::Char(' ')).await?;
        page.press_key(Key::Backspace).await
    }

    pub async fn pause(&mut self, bounds: [u32; 2]) {
        let delay = self.random_duration(bounds);
        sleep(delay).await;
    }

    pub fn plan_keystrokes(&mut self, text: &str) -> Vec<Keystroke> {
        let every = self.config.thinking_pause_every.max(1);
        text.chars()
            .enumerate()
            .map(|(index, ch)| {
                let mut delay = self.random_duration(self.config.keystroke_ms);
                if index % every == 0 && self.config.thinking_pause_max_ms > 0 {
                    delay += Duration::from_millis(u64::from(
                        self.rng.gen_range(0..=self.config.thinking_pause_max_ms),
                    ));
                }
                let key = match ch {
                    '\n' => Key::Enter,
                    other => Key::Char(other),
                };
                Keystroke { key, delay }
            })
            .collect()
    }

    pub fn plan_motion(&mut self, target: Point) -> Vec<MouseStep> {
        let start = self.last_point.unwrap_or_else(|| {
            Point::new(self.rng.gen_range(0.0..400.0), self.rng.gen_range(0.0..300.0))
        });
        let [min_steps, max_steps] = self.config.mouse_steps;
        let steps = self.rng.gen_range(min_steps.max(1)..=max_steps.max(min_steps.max(1)));
        let mut plan = Vec::with_capacity(steps as usize);
        for idx in 1..=steps {
            let t = f64::from(idx) / f64::from(steps);
            let eased = ease_in_out_cubic(t);
            let wobble = if idx == steps { 0.0 } else { 1.2 };
            let point = Point::new(
                start.x + (target.x - start.x) * eased + self.random_offset(wobble),
                start.y + (target.y - start.y) * eased + self.random_offset(wobble),
            );
            let delay = Duration::from_millis(self.rng.gen_range(6..=16));
            plan.push(MouseStep { point, delay });
        }
        plan
    }

    fn random_duration(&mut self, bounds: [u32; 2]) -> Duration {
        let (low, high) = (bounds[0].min(bounds[1]), bounds[0].max(bounds[1]));
        Duration::from_millis(u64::from(self.rng.gen_range(low..=high)))
    }

    fn random_offset(&mut self, max: f64) -> f64 {
        if max <= 0.0 {
            return 0.0;
        }
        self.rng.gen_range(-max..=max)
    }
}

fn ease_in_out_cubic(t: f64) -> f64 {
    if t < 0.5 {
        4.0 * t * t * t
    } else {
        1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::scripted::{PageAction, PageScript, ScriptedSessionProvider};
    use crate::browser::session::SessionProvider;

    #[test]
    fn keystroke_delays_stay_in_bounds() {
        let config = HumanSection::default();
        let mut human = HumanSimulator::with_seed(config.clone(), 7);
        let text = "a".repeat(60);
        let plan = human.plan_keystrokes(&text);
        assert_eq!(plan.len(), 60);
        for (index, stroke) in plan.iter().enumerate() {
            let ms = stroke.delay.as_millis() as u32;
            assert!(ms >= config.keystroke_ms[0]);
            if index % config.thinking_pause_every == 0 {
                assert!(ms <= config.keystroke_ms[1] + config.thinking_pause_max_ms);
            } else {
                assert!(ms <= config.keystroke_ms[1], "index {index} took {ms}ms");
            }
        }
    }

    #[test]
    fn same_seed_same_plan() {
        let config = HumanSection::default();
        let a = HumanSimulator::with_seed(config.clone(), 42).plan_keystrokes("hello world");
        let b = HumanSimulator::with_seed(config, 42).plan_keystrokes("hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn motion_ends_on_target() {
        let mut human = HumanSimulator::with_seed(HumanSection::default(), 3);
        let target = Point::new(640.0, 360.0);
        let plan = human.plan_motion(target);
        let last = plan.last().unwrap();
        assert!((last.point.x - target.x).abs() < 1e-9);
        assert!((last.point.y - target.y).abs() < 1e-9);
        assert!(plan.len() >= 12 && plan.len() <= 32);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_ends_with_space_backspace_pair() {
        let provider = ScriptedSessionProvider::new(PageScript::default());
        let page = provider.open_page("about:blank").await.unwrap();
        let mut human = HumanSimulator::with_seed(HumanSection::default(), 1);
        human.type_text(page.as_ref(), "hi\n").await.unwrap();

        let keys: Vec<Key> = provider.pages()[0]
            .actions()
            .into_iter()
            .filter_map(|action| match action {
                PageAction::Key(key) => Some(key),
                _ => None,
            })
            .collect();
        assert_eq!(
            keys,
            vec![
                Key::Char('h'),
                Key::Char('i'),
                Key::Enter,
                Key::Char(' '),
                Key::Backspace
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn click_scrolls_hovers_then_clicks() {
        let script = PageScript::default().with_element("button.go", "Go");
        let provider = ScriptedSessionProvider::new(script);
        let page = provider.open_page("about:blank").await.unwrap();
        let mut human = HumanSimulator::with_seed(HumanSection::default(), 5);
        let target = Locator::css("button.go");
        human.click(page.as_ref(), &target).await.unwrap();

        let actions = provider.pages()[0].actions();
        let scroll = actions
            .iter()
            .position(|a| matches!(a, PageAction::ScrollIntoView(_)))
            .unwrap();
        let first_move = actions
            .iter()
            .position(|a| matches!(a, PageAction::MouseMove { .. }))
            .unwrap();
        let click = actions
            .iter()
            .position(|a| matches!(a, PageAction::Click(_)))
            .unwrap();
        assert!(scroll < first_move && first_move < click);
    }
}
