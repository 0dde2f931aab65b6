//! Versioned selector table for the Copilot web UI and the Microsoft sign-in pages
//!
//! Every CSS selector the automation uses lives here. When the remote UI
//! changes, this table is the single place to update; bump
//! [`SELECTOR_TABLE_VERSION`] so error hints point at the right revision.

use std::fmt;

pub const SELECTOR_TABLE_VERSION: &str = "2025.06";

/// A CSS selector, optionally narrowed to elements whose text contains `text`
/// (case-insensitive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Selector {
    pub css: &'static str,
    pub text: Option<&'static str>,
}

impl Selector {
    pub const fn css(css: &'static str) -> Self {
        Self { css, text: None }
    }

    pub const fn with_text(css: &'static str, text: &'static str) -> Self {
        Self {
            css,
            text: Some(text),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.text {
            Some(text) => write!(f, "{}:has-text(\"{}\")", self.css, text),
            None => f.write_str(self.css),
        }
    }
}

/// Renders a selector group for error messages
pub fn describe(group: &[Selector]) -> String {
    group
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" | ")
}

pub struct SelectorTable {
    // Chat surface
    pub prompt_input: &'static [Selector],
    pub send_button: &'static [Selector],
    pub stop_generating: &'static [Selector],
    pub messages: &'static [Selector],
    pub raw_markdown: &'static [Selector],
    pub overlay_dismiss: &'static [Selector],

    // Sign-in
    pub sign_in: &'static [Selector],
    pub logged_in: &'static [Selector],
    pub username_input: &'static [Selector],
    pub password_input: &'static [Selector],
    pub login_submit: &'static [Selector],
    pub login_error: &'static [Selector],
    pub stay_signed_in: &'static [Selector],
    pub otp_input: &'static [Selector],
    pub otp_submit: &'static [Selector],

    // Attachments and artifacts
    pub attach_button: &'static [Selector],
    pub file_input: &'static [Selector],
    pub attachment_chip: &'static [Selector],
    pub upload_progress: &'static [Selector],
    pub download_buttons: &'static [Selector],
}

pub static SELECTORS: SelectorTable = SelectorTable {
    prompt_input: &[
        Selector::css("textarea#userInput"),
        Selector::css("textarea"),
        Selector::css("[role=\"textbox\"]"),
    ],
    send_button: &[
        Selector::css("button[aria-label=\"Send\"]"),
        Selector::css("button[data-testid=\"send-button\"]"),
        Selector::css("button[type=\"submit\"]"),
    ],
    stop_generating: &[
        Selector::css("button[aria-label=\"Stop generating\"]"),
        Selector::css("button[data-testid=\"stop-button\"]"),
        Selector::with_text("button", "Stop generating"),
    ],
    messages: &[
        Selector::css("div[role=\"article\"]"),
        Selector::css("div.chat-response"),
        Selector::css("div[data-content=\"message\"]"),
        Selector::css("div[aria-live=\"polite\"]"),
        Selector::css("div[role=\"dialog\"] article"),
        Selector::css("[data-testid=\"message\"]"),
    ],
    raw_markdown: &[
        Selector::css("div[data-testid=\"markdown\"] pre"),
        Selector::css("div.rounded-b-xl pre"),
        Selector::css("pre.markdown"),
    ],
    overlay_dismiss: &[
        Selector::with_text("button", "Accept all"),
        Selector::with_text("button", "Accept"),
        Selector::with_text("button", "Got it"),
        Selector::with_text("button", "Continue"),
        Selector::with_text("button", "Allow"),
        Selector::with_text("button", "OK"),
        Selector::css("button[aria-label=\"Close\"]"),
        Selector::with_text("button", "Not now"),
    ],

    sign_in: &[
        Selector::with_text("a", "Sign in"),
        Selector::with_text("button", "Sign in"),
        Selector::with_text("[role=\"button\"]", "Sign in"),
    ],
    logged_in: &[
        Selector::css("[aria-label*=\"Account\"]"),
        Selector::css("[data-testid*=\"user\"]"),
        Selector::css("[data-testid*=\"profile\"]"),
        Selector::css("button[aria-label*=\"profile\" i]"),
    ],
    username_input: &[
        Selector::css("#i0116"),
        Selector::css("input[name=\"loginfmt\"]"),
        Selector::css("input[type=\"email\"]"),
    ],
    password_input: &[
        Selector::css("#i0118"),
        Selector::css("input[name=\"passwd\"]"),
        Selector::css("input[type=\"password\"]"),
    ],
    login_submit: &[
        Selector::css("#idSIButton9"),
        Selector::css("input[type=\"submit\"]"),
        Selector::css("button[type=\"submit\"]"),
        Selector::with_text("button", "Next"),
        Selector::with_text("button", "Sign in"),
    ],
    login_error: &[
        Selector::css("#usernameError"),
        Selector::css("#passwordError"),
        Selector::css("#idTD_Error"),
        Selector::css("div[role=\"alert\"]"),
    ],
    stay_signed_in: &[
        Selector::with_text("#idSIButton9", "Yes"),
        Selector::css("#acceptButton"),
        Selector::with_text("button", "Yes"),
    ],
    otp_input: &[
        Selector::css("input[name=\"otc\"]"),
        Selector::css("#idTxtBx_SAOTCC_OTC"),
    ],
    otp_submit: &[
        Selector::css("#idSubmit_SAOTCC_Continue"),
        Selector::css("input[type=\"submit\"]"),
        Selector::css("button[type=\"submit\"]"),
    ],

    attach_button: &[
        Selector::css("[data-testid=\"plus-button\"]"),
        Selector::css("button[aria-label=\"Attach\"]"),
        Selector::css("button[data-testid=\"upload-button\"]"),
    ],
    file_input: &[
        Selector::css("[data-testid=\"file-upload-button\"] input[type=\"file\"]"),
        Selector::css("input[type=\"file\"]"),
    ],
    attachment_chip: &[
        Selector::css("[data-testid=\"attachment-chip\"]"),
        Selector::css("[data-testid=\"file-preview\"]"),
        Selector::css("[aria-label*=\"Remove attachment\"]"),
    ],
    upload_progress: &[
        Selector::css("[data-testid=\"upload-progress\"]"),
        Selector::css("[role=\"progressbar\"]"),
    ],
    download_buttons: &[
        Selector::css("a[download]"),
        Selector::css("button[aria-label=\"Download\"]"),
        Selector::css("button[data-testid=\"download-button\"]"),
        Selector::with_text("button", "Download"),
    ],
};

/// Candidate texts starting with these are UI status lines, not answers
pub const STATUS_PREFIXES: &[&str] = &[
    "You said",
    "Uploading file",
    "Uploaded file",
    "Working on it",
];

/// Candidate texts containing these are suggestion chips or banners
pub const NOISY_PHRASES: &[&str] = &[
    "Nice to see you",
    "Copilot may make mistakes",
    "Your conversations are personalised",
    "Quick response",
    "Create an image",
    "Write a first draft",
    "Improve writing",
    "Design a logo",
    "Write a joke",
    "Rewrite a classic",
    "Draft an email",
    "Take a personality quiz",
    "Predict the future",
    "Improve communication",
];
