use serde::{Deserialize, Serialize};

/// Canonical four-valued judgment outcome for one step or a whole case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalResult {
    Correct,
    Incorrect,
    Spam,
    NeedDiscussion,
}

impl FinalResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalResult::Correct => "Correct",
            FinalResult::Incorrect => "Incorrect",
            FinalResult::Spam => "Spam",
            FinalResult::NeedDiscussion => "NeedDiscussion",
        }
    }
}

impl std::fmt::Display for FinalResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured verdict recovered from judge output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub result: FinalResult,
    pub reason: String,
}

/// Case-level result: where the walk stopped (if it did) and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseOutcome {
    pub final_result: FinalResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopping_step: Option<u32>,
    pub reason: String,
}

impl CaseOutcome {
    pub fn correct() -> Self {
        Self {
            final_result: FinalResult::Correct,
            stopping_step: None,
            reason: String::new(),
        }
    }

    pub fn stopped(step_number: u32, result: FinalResult, reason: impl Into<String>) -> Self {
        Self {
            final_result: result,
            stopping_step: Some(step_number),
            reason: reason.into(),
        }
    }

    pub fn need_discussion(step_number: Option<u32>, reason: impl Into<String>) -> Self {
        Self {
            final_result: FinalResult::NeedDiscussion,
            stopping_step: step_number,
            reason: reason.into(),
        }
    }
}

/// Closed step-type vocabulary assigned by the classification call.
///
/// Each variant maps to one rule-storage key; unknown labels from the model
/// are a recoverable condition (the step stays unclassified), never a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepType {
    Navigation,
    FunctionalLayout,
    UiRendering,
    AppearanceTheme,
    BrowserSettings,
    EnvironmentSetup,
    Advertising,
    Localization,
    Accessibility,
    Carousel,
    MediaPlayback,
    Authentication,
    TabWindow,
    Modals,
    Search,
    OsIntegration,
}

impl StepType {
    pub const ALL: [StepType; 16] = [
        StepType::Navigation,
        StepType::FunctionalLayout,
        StepType::UiRendering,
        StepType::AppearanceTheme,
        StepType::BrowserSettings,
        StepType::EnvironmentSetup,
        StepType::Advertising,
        StepType::Localization,
        StepType::Accessibility,
        StepType::Carousel,
        StepType::MediaPlayback,
        StepType::Authentication,
        StepType::TabWindow,
        StepType::Modals,
        StepType::Search,
        StepType::OsIntegration,
    ];

    /// Label used in the classification prompt and expected back from the model.
    pub fn label(&self) -> &'static str {
        match self {
            StepType::Navigation => "Navigation & URL Redirection",
            StepType::FunctionalLayout => "Functional Layout Setting",
            StepType::UiRendering => "UI Visibility, Layout & Rendering Verification",
            StepType::AppearanceTheme => "Appearance & Theme Settings",
            StepType::BrowserSettings => "Browser Settings & Configuration",
            StepType::EnvironmentSetup => "Environment & Precondition Setup",
            StepType::Advertising => "Advertising Verification & Reporting",
            StepType::Localization => "Localization & Internationalization",
            StepType::Accessibility => "Accessibility & Keyboard Navigation",
            StepType::Carousel => "Carousel & Slider Controls",
            StepType::MediaPlayback => "Media Playback & Audio Control",
            StepType::Authentication => "Authentication & User Profile Management",
            StepType::TabWindow => "Tab & Window Management",
            StepType::Modals => "Modals, Popups & Notifications Handling",
            StepType::Search => "Search Functionality & SERP Module Validation",
            StepType::OsIntegration => "Widgets, Taskbar & OS-Level Integrations",
        }
    }

    /// File stem for the rule body in a filesystem rule store.
    pub fn rule_key(&self) -> &'static str {
        match self {
            StepType::Navigation => "navigation",
            StepType::FunctionalLayout => "functional_layout",
            StepType::UiRendering => "ui_rendering",
            StepType::AppearanceTheme => "appearance_theme",
            StepType::BrowserSettings => "browser_settings",
            StepType::EnvironmentSetup => "environment_setup",
            StepType::Advertising => "advertising",
            StepType::Localization => "localization",
            StepType::Accessibility => "accessibility",
            StepType::Carousel => "carousel",
            StepType::MediaPlayback => "media_playback",
            StepType::Authentication => "authentication",
            StepType::TabWindow => "tab_window",
            StepType::Modals => "modals",
            StepType::Search => "search",
            StepType::OsIntegration => "os_integration",
        }
    }

    /// Case/whitespace-tolerant reverse lookup from a model-produced label.
    pub fn from_label(label: &str) -> Option<StepType> {
        let wanted = normalize_label_key(label);
        if wanted.is_empty() {
            return None;
        }
        Self::ALL
            .iter()
            .copied()
            .find(|t| {
                normalize_label_key(t.label()) == wanted
                    || normalize_label_key(t.rule_key()) == wanted
            })
    }
}

fn normalize_label_key(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// One scraped pane entry: free text plus an optional image reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaseStep {
    #[serde(default)]
    pub text: String,
    #[serde(default, alias = "img", skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// One unit of the assembled plan, in the external 1-based step space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_number: u32,
    /// Classification outcome; `None` when the plan call failed or the model
    /// produced a label outside the closed vocabulary.
    pub step_type: Option<StepType>,
    pub standard_text: String,
    /// Controlled-vocabulary restatement from the classification call, or the
    /// literal standard/actual content on fallback.
    pub ai_text: String,
    pub actual_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub standard_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_image: Option<String>,
    /// Derived flag: the step's success requires multiple sub-actions.
    pub multi_action: bool,
}

impl StepRecord {
    /// Evidence forwarded to the judge: the actual screenshot when present,
    /// otherwise the standard one.
    pub fn evidence_image(&self) -> Option<&str> {
        self.actual_image
            .as_deref()
            .or(self.standard_image.as_deref())
    }
}

/// Prior step carried into later judging requests. Only Correct steps are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryStep {
    pub step_number: u32,
    pub final_result: FinalResult,
    pub reason: String,
}

/// Grounding example persisted after a successful optimization round.
/// Uniqueness key is `(step_type, raw_desc)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleCase {
    pub step_type: StepType,
    #[serde(rename = "step_raw_desc")]
    pub raw_desc: String,
    #[serde(rename = "step_ai_desc")]
    pub ai_desc: String,
    #[serde(rename = "step_success_reason")]
    pub success_reason: String,
}

/// One typed part of a structured user message for the judge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageRef { url: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        ContentPart::ImageRef { url: url.into() }
    }
}

/// Completion returned by an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub provider: String,
    pub model: String,
}
