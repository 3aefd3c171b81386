//! Classification of pop-up windows by title and message, and the recovery
//! action for each. New dialogs are handled by adding a row to [`RULES`].

use std::time::Duration;

use serde::Serialize;

use crate::clock::Clock;
use crate::config::LayoutConfig;
use crate::locator::{company_name_from_title, WindowLocator};
use crate::primitives::{poll_until, wait_for_element};
use crate::surface::{ControlHandle, UiSurface};

pub const ADD_CONNECTION: &str = "ADD_CONNECTION";
pub const UNBALANCED_ENTRY: &str = "UNBALANCED_ENTRY";
pub const VERSION_INCOMPATIBLE: &str = "VERSION_INCOMPATIBLE";
pub const DB_HEALTH_CRITICAL: &str = "DB_HEALTH_CRITICAL";
pub const ACCOUNT_CREATION_NOTICE: &str = "ACCOUNT_CREATION_NOTICE";
pub const EXPECTED_CONTROL_MISSING: &str = "expected control missing";

pub const SCHEMA_UPDATE_TITLE: &str = "Proceso de actualización de esquemas";
pub const SCHEMA_UPDATE_TIMEOUT: Duration = Duration::from_secs(1200);
pub const SCHEMA_UPDATE_INTERVAL: Duration = Duration::from_secs(1);
pub const BUTTON_WAIT: Duration = Duration::from_secs(10);
pub const BUTTON_POLL: Duration = Duration::from_millis(250);

pub const ACCEPT: &str = "&Aceptar";
pub const NO: &str = "&No";

/// A pop-up as seen at one instant. Handing it to [`DialogHandler::handle`]
/// consumes it, so each capture is classified once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DialogEvent {
    pub title: String,
    pub message: String,
}

impl DialogEvent {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into().trim().to_string(),
            message: message.into().trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum DialogOutcome {
    Ignored(Option<String>),
    Handled(Option<String>),
    Failed(String),
    Unrecognized,
}

impl DialogOutcome {
    /// Anything but `Ignored` ends a classification loop.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Ignored(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Unrecognized)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "button", rename_all = "snake_case")]
pub enum DialogAction {
    None,
    Press(&'static str),
    /// Press, then wait for the schema update window to go away.
    PressAndAwaitSchemaUpdate(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub rule: &'static str,
    pub action: DialogAction,
    pub outcome: DialogOutcome,
}

#[derive(Debug, Clone, Copy)]
enum TitleRule {
    Empty,
    Exact(&'static str),
    MainWindow,
    Catalog,
}

#[derive(Debug, Clone, Copy)]
enum MessageRule {
    Any,
    Empty,
    StartsWith(&'static [&'static str]),
    Contains(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy)]
enum OutcomeRule {
    Ignored,
    IgnoredWithMessage,
    Handled(Option<&'static str>),
    Failed(&'static str),
    CompanyFromTitle,
    Unrecognized,
}

#[derive(Debug, Clone, Copy)]
struct Rule {
    name: &'static str,
    title: TitleRule,
    message: MessageRule,
    action: DialogAction,
    outcome: OutcomeRule,
}

const fn rule(
    name: &'static str,
    title: TitleRule,
    message: MessageRule,
    action: DialogAction,
    outcome: OutcomeRule,
) -> Rule {
    Rule {
        name,
        title,
        message,
        action,
        outcome,
    }
}

const BENIGN_PROGRESS: &[&str] = &[
    "Abriendo la empresa",
    "Creando ADD",
    "Proceso de actualización de esquemas...",
    "Empresas a las",
];
const SCHEMA_NOTICES: &[&str] = &[
    "Uno de tus certificados ha expirado",
    "Se identificó una nueva versión de esquemas del ADD",
];

use DialogAction::{None as NoAction, Press, PressAndAwaitSchemaUpdate};
use MessageRule::{Any, Contains, Empty, StartsWith};
use TitleRule::{Catalog, Exact, MainWindow};

/// Evaluated top to bottom; the first matching row wins.
const RULES: &[Rule] = &[
    rule("progress still loading", TitleRule::Empty, Empty, NoAction, OutcomeRule::Ignored),
    rule(
        "progress notice",
        TitleRule::Empty,
        StartsWith(BENIGN_PROGRESS),
        NoAction,
        OutcomeRule::Ignored,
    ),
    rule("unknown progress", TitleRule::Empty, Any, NoAction, OutcomeRule::Unrecognized),
    rule(
        "schema or certificate notice",
        Exact("Información"),
        Contains(SCHEMA_NOTICES),
        PressAndAwaitSchemaUpdate(ACCEPT),
        OutcomeRule::Ignored,
    ),
    rule("problem still loading", Exact("Problema"), Empty, NoAction, OutcomeRule::Ignored),
    rule(
        "manager connection error",
        Exact("Problema"),
        Contains(&["Error al tratar de conectarse al administrador"]),
        Press(ACCEPT),
        OutcomeRule::Failed(ADD_CONNECTION),
    ),
    rule(
        "unbalanced entry",
        Exact("Problema"),
        Contains(&["Los importes de cargos y abonos no son iguales"]),
        Press(ACCEPT),
        OutcomeRule::Handled(Some(UNBALANCED_ENTRY)),
    ),
    rule(
        "confirmation still loading",
        Exact("Confirmación"),
        Empty,
        NoAction,
        OutcomeRule::Ignored,
    ),
    rule(
        "database version incompatible",
        Exact("Confirmación"),
        Contains(&["La versión de la Base de datos de la empresa"]),
        Press(NO),
        OutcomeRule::Failed(VERSION_INCOMPATIBLE),
    ),
    rule(
        "database health prompt",
        Exact("Confirmación"),
        Contains(&["La salud de la base de datos se encuentra en estado crítico"]),
        Press(NO),
        OutcomeRule::IgnoredWithMessage,
    ),
    rule("confirmation default", Exact("Confirmación"), Any, NoAction, OutcomeRule::Handled(None)),
    rule("warning still loading", Exact("Advertencia"), Empty, NoAction, OutcomeRule::Ignored),
    rule(
        "account creation notice",
        Exact("Advertencia"),
        Contains(&["El número de cuentas de clientes / proveedores que desea crear"]),
        Press(ACCEPT),
        OutcomeRule::Handled(Some(ACCOUNT_CREATION_NOTICE)),
    ),
    rule(
        "database health critical",
        Exact("Advertencia"),
        Contains(&["La salud de la base de datos"]),
        Press(NO),
        OutcomeRule::Failed(DB_HEALTH_CRITICAL),
    ),
    rule("company opened", MainWindow, Any, NoAction, OutcomeRule::CompanyFromTitle),
    rule("catalog window", Catalog, Any, NoAction, OutcomeRule::Ignored),
];

fn title_matches(rule: TitleRule, title: &str, layout: &LayoutConfig) -> bool {
    match rule {
        TitleRule::Empty => title.is_empty(),
        TitleRule::Exact(expected) => title == expected,
        TitleRule::MainWindow => title.starts_with(layout.main_title.as_str()),
        TitleRule::Catalog => title.starts_with(layout.catalog_title.as_str()),
    }
}

fn message_matches(rule: MessageRule, message: &str) -> bool {
    match rule {
        MessageRule::Any => true,
        MessageRule::Empty => message.is_empty(),
        MessageRule::StartsWith(prefixes) => prefixes.iter().any(|p| message.starts_with(p)),
        MessageRule::Contains(fragments) => fragments.iter().any(|f| message.contains(f)),
    }
}

/// Pure decision for `event`: what to press and what it means.
pub fn classify(event: &DialogEvent, layout: &LayoutConfig) -> Verdict {
    let matched = RULES.iter().find(|rule| {
        title_matches(rule.title, &event.title, layout)
            && message_matches(rule.message, &event.message)
    });
    let Some(rule) = matched else {
        return Verdict {
            rule: "no rule",
            action: DialogAction::None,
            outcome: DialogOutcome::Unrecognized,
        };
    };
    let outcome = match rule.outcome {
        OutcomeRule::Ignored => DialogOutcome::Ignored(None),
        OutcomeRule::IgnoredWithMessage => DialogOutcome::Ignored(Some(event.message.clone())),
        OutcomeRule::Handled(info) => DialogOutcome::Handled(info.map(ToString::to_string)),
        OutcomeRule::Failed(reason) => DialogOutcome::Failed(reason.to_string()),
        OutcomeRule::Unrecognized => DialogOutcome::Unrecognized,
        OutcomeRule::CompanyFromTitle => {
            match company_name_from_title(&event.title, &layout.main_title) {
                Some(name) => DialogOutcome::Handled(Some(name)),
                None => DialogOutcome::Ignored(None),
            }
        }
    };
    Verdict {
        rule: rule.name,
        action: rule.action,
        outcome,
    }
}

pub struct DialogHandler<'a> {
    ui: &'a dyn UiSurface,
    clock: &'a dyn Clock,
    layout: &'a LayoutConfig,
}

impl<'a> DialogHandler<'a> {
    pub fn new(ui: &'a dyn UiSurface, clock: &'a dyn Clock, layout: &'a LayoutConfig) -> Self {
        Self { ui, clock, layout }
    }

    /// Title and first label of the foreground window.
    pub fn capture(&self) -> Option<DialogEvent> {
        let locator = WindowLocator::new(self.ui, self.clock);
        let title = locator.foreground_title()?;
        let message = locator
            .control_text(&ControlHandle::foreground(), "Static", 0)
            .unwrap_or_default();
        Some(DialogEvent::new(title, message))
    }

    pub fn capture_window(&self, window: &ControlHandle) -> Option<DialogEvent> {
        let title = self.ui.window_text(window).ok()?;
        let message = WindowLocator::new(self.ui, self.clock)
            .control_text(window, "Static", 0)
            .unwrap_or_default();
        Some(DialogEvent::new(title, message))
    }

    pub fn handle(&self, event: DialogEvent) -> DialogOutcome {
        let verdict = classify(&event, self.layout);
        log::debug!(
            "[dialog] '{}' / '{}' matched '{}'",
            event.title,
            event.message,
            verdict.rule
        );
        match verdict.action {
            DialogAction::None => {}
            DialogAction::Press(button) => {
                if let Err(outcome) = self.press(&event, button) {
                    return outcome;
                }
            }
            DialogAction::PressAndAwaitSchemaUpdate(button) => {
                if let Err(outcome) = self.press(&event, button) {
                    return outcome;
                }
                self.await_schema_update();
            }
        }
        match &verdict.outcome {
            DialogOutcome::Unrecognized => log::warn!(
                "[dialog] unrecognized window: title='{}' message='{}'",
                event.title,
                event.message
            ),
            DialogOutcome::Failed(reason) => {
                log::error!("[dialog] {reason}: {}", event.message)
            }
            DialogOutcome::Ignored(Some(reason)) => {
                log::warn!("[dialog] continuing past: {reason}")
            }
            _ => {}
        }
        verdict.outcome
    }

    fn press(&self, event: &DialogEvent, button: &str) -> std::result::Result<(), DialogOutcome> {
        let target = ControlHandle::titled(&event.title).button(button);
        if wait_for_element(self.ui, self.clock, &target, BUTTON_WAIT, BUTTON_POLL).is_err() {
            log::error!("[dialog] {EXPECTED_CONTROL_MISSING}: {target}");
            return Err(DialogOutcome::Failed(format!("{EXPECTED_CONTROL_MISSING}: {button}")));
        }
        self.ui.click(&target).map_err(|err| {
            log::error!("[dialog] cannot press {target}: {err}");
            DialogOutcome::Failed(format!("{EXPECTED_CONTROL_MISSING}: {button}"))
        })
    }

    fn await_schema_update(&self) {
        let locator = WindowLocator::new(self.ui, self.clock);
        let done = poll_until(self.clock, SCHEMA_UPDATE_TIMEOUT, SCHEMA_UPDATE_INTERVAL, || {
            (!locator.is_top_window_with_title(SCHEMA_UPDATE_TITLE)).then_some(())
        });
        if done.is_none() {
            log::warn!("[dialog] schema update still running after {SCHEMA_UPDATE_TIMEOUT:?}");
        }
    }

    /// Captures and handles whatever is in the foreground.
    pub fn handle_foreground(&self) -> Option<DialogOutcome> {
        self.capture().map(|event| self.handle(event))
    }
}
