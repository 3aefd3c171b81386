//! Login sequence. Works whether or not the application shows its login
//! window; an existing session goes straight to the main window.

use std::time::Duration;

use serde::Serialize;

use crate::dialog::ACCEPT;
use crate::error::{AutomationError, Result};
use crate::primitives::{poll_until, wait_for_element};
use crate::surface::ControlHandle;

use super::posting::escape_keys;
use super::Desktop;

pub const LOGIN_WAIT: Duration = Duration::from_secs(80);
pub const PROBLEM_WAIT: Duration = Duration::from_secs(3);
pub const MAIN_WAIT: Duration = Duration::from_secs(15);
pub const SESSION_CHECK: Duration = Duration::from_secs(5);
pub const PROBLEM_TITLE: &str = "Problema";

const POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginOutcome {
    LoggedIn,
    AlreadyAuthenticated,
}

fn bring_forward(desktop: &Desktop<'_>, main: &ControlHandle) -> Result<()> {
    desktop.ui.maximize(main)?;
    desktop.ui.focus(main)?;
    log::debug!("[login] main window maximized and focused");
    Ok(())
}

/// Signs in with `user`/`password`. A "Problema" window after submitting means
/// the credentials were rejected; that and a missing main window are fatal.
pub fn login(
    desktop: &Desktop<'_>,
    user: &str,
    password: &str,
    wait: Duration,
) -> Result<LoginOutcome> {
    let ui = desktop.ui;
    let clock = desktop.clock;
    let login = ControlHandle::title_contains(&desktop.layout.login_title);
    let main = ControlHandle::title_prefix(&desktop.layout.main_title);

    if wait_for_element(ui, clock, &login, wait, POLL).is_err() {
        log::info!("[login] no login window; checking for an open session");
        return match wait_for_element(ui, clock, &main, SESSION_CHECK, POLL) {
            Ok(_) => {
                bring_forward(desktop, &main)?;
                Ok(LoginOutcome::AlreadyAuthenticated)
            }
            Err(_) => Err(AutomationError::Environment(
                "neither the login nor the main window is available".to_string(),
            )),
        };
    }

    ui.focus(&login)?;
    ui.type_text(&login.child(Some("Edit"), None), &escape_keys(user))?;
    ui.type_text(&login.child(Some("Edit"), None).nth(1), &escape_keys(password))?;
    ui.click(&login.button(ACCEPT))?;
    log::info!("[login] credentials submitted for '{user}'");

    let problem = ControlHandle::titled(PROBLEM_TITLE);
    let rejected = poll_until(clock, PROBLEM_WAIT, POLL, || {
        ui.exists(&problem).ok().filter(|exists| *exists)
    });
    if rejected.is_some() {
        log::error!(
            "[login] '{PROBLEM_TITLE}' window after submitting; user or password may be wrong"
        );
        if let Err(err) = ui.click(&problem.button(ACCEPT)) {
            log::warn!("[login] cannot acknowledge '{PROBLEM_TITLE}': {err}");
        }
        if let Err(err) = ui.close(&login) {
            log::warn!("[login] cannot close the login window: {err}");
        }
        return Err(AutomationError::Environment("invalid credentials".to_string()));
    }

    wait_for_element(ui, clock, &main, MAIN_WAIT, POLL)
        .map_err(|err| AutomationError::Environment(format!("main window after login: {err}")))?;
    bring_forward(desktop, &main)?;
    log::info!("[login] signed in");
    Ok(LoginOutcome::LoggedIn)
}
