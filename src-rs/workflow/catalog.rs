//! Company catalog: open it from the main toolbar, read the company list, open
//! one company while classifying whatever the application pops up, and close
//! it again.

use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;

use crate::dialog::DialogOutcome;
use crate::error::{AutomationError, Result};
use crate::locator::company_name_from_title;
use crate::matcher::Affordance;
use crate::primitives::{poll_until, retry_action, wait_for_element, RetryPolicy};
use crate::surface::ControlHandle;

use super::{Desktop, MAIN_WINDOW_WAIT};

pub const CATALOG_ATTEMPTS: u32 = 20;
pub const CATALOG_SETTLE: Duration = Duration::from_secs(2);
pub const CATALOG_BACKOFF: Duration = Duration::from_secs(3);
pub const CATALOG_WAIT: Duration = Duration::from_secs(30);
pub const LIST_WAIT: Duration = Duration::from_secs(10);
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(600);
pub const OPEN_POLL: Duration = Duration::from_millis(500);
pub const CLOSE_WAIT: Duration = Duration::from_secs(10);
pub const CLOSE_COMPANY_MENU: &str = "Empresa->Cerrar empresa";

const POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    pub id: String,
    pub database: String,
    pub location: String,
}

fn cell(row: &[String], at: usize) -> String {
    row.get(at).map(|c| c.trim().to_string()).unwrap_or_default()
}

fn short_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        ..RetryPolicy::default()
    }
}

fn catalog_window(desktop: &Desktop<'_>) -> ControlHandle {
    ControlHandle::title_prefix(&desktop.layout.catalog_title)
}

fn company_list(desktop: &Desktop<'_>) -> ControlHandle {
    catalog_window(desktop).child(Some("SysListView32"), None)
}

/// Brings the main window forward and opens the catalog through its toolbar
/// icon.
pub fn open_catalog(desktop: &Desktop<'_>) -> Result<()> {
    let ui = desktop.ui;
    let locator = desktop.locator();
    let catalog_title = desktop.layout.catalog_title.as_str();
    if locator.is_top_window_with_title(catalog_title) {
        log::debug!("[catalog] already open");
        return Ok(());
    }

    let main = desktop.main_window(MAIN_WINDOW_WAIT)?;
    retry_action(desktop.clock, short_retry(), |_| {
        ui.maximize(&main)?;
        ui.focus(&main)
    })
    .map_err(|err| AutomationError::Environment(format!("main window not focusable: {err}")))?;

    let policy = RetryPolicy::new(CATALOG_ATTEMPTS, CATALOG_BACKOFF, 1.0);
    retry_action(desktop.clock, policy, |attempt| {
        if !desktop.click_image(Affordance::Catalog) {
            return Err(format!("catalog icon not found (attempt {attempt})"));
        }
        desktop.pause(CATALOG_SETTLE);
        if locator.is_top_window_with_title(catalog_title) {
            Ok(())
        } else {
            Err(format!("catalog window not in front (attempt {attempt})"))
        }
    })?;
    log::info!("[catalog] opened");
    Ok(())
}

pub fn list_companies(desktop: &Desktop<'_>) -> Result<Vec<CatalogEntry>> {
    let ui = desktop.ui;
    let catalog = catalog_window(desktop);
    wait_for_element(ui, desktop.clock, &catalog, CATALOG_WAIT, POLL)?;
    let list = company_list(desktop);
    wait_for_element(ui, desktop.clock, &list, LIST_WAIT, POLL)?;

    let rows = retry_action(desktop.clock, short_retry(), |_| ui.list_rows(&list))?;
    let location = desktop
        .locator()
        .text_after_label(&catalog, &desktop.layout.location_label, desktop.layout.location_offset)
        .unwrap_or_default();

    let companies: Vec<CatalogEntry> = rows
        .iter()
        .filter(|row| row.first().is_some_and(|name| !name.trim().is_empty()))
        .map(|row| CatalogEntry {
            name: cell(row, 0),
            id: cell(row, 1),
            database: cell(row, 2),
            location: location.clone(),
        })
        .collect();
    log::info!("[catalog] {} companies listed", companies.len());
    Ok(companies)
}

/// Opens `name` from the catalog and classifies the foreground window until
/// the outcome is terminal. `Ignored` keeps the loop polling.
pub fn open_company(desktop: &Desktop<'_>, name: &str) -> Result<DialogOutcome> {
    let ui = desktop.ui;
    let list = company_list(desktop);
    wait_for_element(ui, desktop.clock, &list, LIST_WAIT, POLL)?;
    let rows = retry_action(desktop.clock, short_retry(), |_| ui.list_rows(&list))?;
    let row = rows
        .iter()
        .position(|row| row.first().is_some_and(|cell| cell.trim() == name))
        .ok_or_else(|| {
            AutomationError::ControlMissing(format!("company '{name}' not in catalog"))
        })?;

    log::info!("[catalog] opening '{name}'");
    retry_action(desktop.clock, short_retry(), |_| ui.activate_row(&list, row))?;

    let dialogs = desktop.dialogs();
    let mut seen = HashSet::new();
    let outcome = poll_until(desktop.clock, OPEN_TIMEOUT, OPEN_POLL, || {
        let event = dialogs.capture()?;
        if !seen.insert(event.clone()) {
            return None;
        }
        let outcome = dialogs.handle(event);
        outcome.is_terminal().then_some(outcome)
    });
    match outcome {
        Some(outcome) => {
            log::info!("[catalog] '{name}': {outcome:?}");
            Ok(outcome)
        }
        None => Err(AutomationError::timeout(format!("company '{name}' to open"), OPEN_TIMEOUT)),
    }
}

/// Closes the open company and waits until the main title no longer names it.
pub fn close_company(desktop: &Desktop<'_>) -> Result<()> {
    let ui = desktop.ui;
    let main_title = desktop.layout.main_title.as_str();
    let main = desktop.main_window(MAIN_WINDOW_WAIT)?;
    ui.select_menu(&main, CLOSE_COMPANY_MENU)?;
    desktop.pause(Duration::from_secs(1));

    let closed = poll_until(desktop.clock, CLOSE_WAIT, POLL, || {
        let title = ui.window_text(&main).ok()?;
        company_name_from_title(&title, main_title).is_none().then_some(())
    });
    if closed.is_none() {
        return Err(AutomationError::timeout("company to close", CLOSE_WAIT));
    }
    log::info!("[catalog] company closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialog::VERSION_INCOMPATIBLE;
    use crate::testkit::{Event, FakeControl};
    use crate::workflow::fixtures::Host;

    const MAIN: &str = "CONTPAQi® Contabilidad";
    const OPENED: &str = "CONTPAQi® Contabilidad - Alpha SA - Ejercicio 2024";

    fn catalog_controls() -> Vec<FakeControl> {
        vec![
            FakeControl::new("Static", "Ubicación:"),
            FakeControl::new("Static", r"C:\Compac\Empresas"),
            FakeControl::list(&[
                &["Alpha SA", "1", "ctAlpha"],
                &["Beta SA", "2", "ctBeta"],
                &["", "", ""],
            ]),
            FakeControl::new("Button", "&Aceptar"),
        ]
    }

    fn host_with_catalog() -> (Host, u64, u64) {
        let host = Host::new();
        let main = host.desktop.open_window(MAIN, vec![]);
        let catalog = host.desktop.open_window("Catálogo de Empresas", catalog_controls());
        (host, main, catalog)
    }

    #[test]
    fn catalog_opens_through_toolbar_icon() {
        let host = Host::new();
        host.desktop.open_window(MAIN, vec![]);
        let icon = host.show(Affordance::Catalog);
        host.desktop.edit(move |state| {
            state.on_pointer(icon, |state| {
                if !state.has_window("Catálogo de Empresas") {
                    state.open_window("Catálogo de Empresas", catalog_controls());
                }
            });
        });

        open_catalog(&host.desktop()).unwrap();

        let events = host.desktop.events();
        assert!(matches!(events[0], Event::Maximize(_)));
        assert!(matches!(events[1], Event::Focus(_)));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, Event::PointerClick { .. }))
                .count(),
            1
        );
        assert_eq!(host.clock.sleeps(), vec![CATALOG_SETTLE]);
    }

    #[test]
    fn missing_main_window_is_an_environment_error() {
        let host = Host::new();
        let err = open_catalog(&host.desktop()).unwrap_err();
        assert!(matches!(err, AutomationError::Environment(_)));
        assert!(err.is_fatal());
        assert!(host.desktop.events().is_empty());
        assert!(host.clock.elapsed() >= MAIN_WINDOW_WAIT);

        let err = close_company(&host.desktop()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn listing_reads_rows_and_location() {
        let (host, _, _) = host_with_catalog();
        let companies = list_companies(&host.desktop()).unwrap();
        assert_eq!(companies.len(), 2);
        assert_eq!(
            companies[1],
            CatalogEntry {
                name: "Beta SA".to_string(),
                id: "2".to_string(),
                database: "ctBeta".to_string(),
                location: r"C:\Compac\Empresas".to_string(),
            }
        );
    }

    #[test]
    fn opening_waits_through_progress_until_main_title_names_company() {
        let (host, main, catalog) = host_with_catalog();
        host.desktop.edit(move |state| {
            state.on(move |event, state| {
                if !matches!(event, Event::ActivateRow { row: 0, .. }) {
                    return;
                }
                let text = FakeControl::new("Static", "Abriendo la empresa...");
                let progress = state.open_window("", vec![text]);
                state.schedule_in(Duration::from_secs(4), move |state| {
                    state.close_window(progress);
                    state.close_window(catalog);
                    state.window_mut(main).title = OPENED.to_string();
                    state.set_foreground(main);
                });
            });
        });

        let outcome = open_company(&host.desktop(), "Alpha SA").unwrap();

        assert_eq!(outcome, DialogOutcome::Handled(Some("Alpha SA".to_string())));
        assert!(host.clock.elapsed() >= Duration::from_secs(4));
        assert!(host.clock.elapsed() < Duration::from_secs(6));
    }

    #[test]
    fn incompatible_database_prompt_fails_the_company() {
        let (host, _, _) = host_with_catalog();
        host.desktop.edit(|state| {
            state.on(|event, state| {
                if matches!(event, Event::ActivateRow { row: 1, .. }) {
                    state.open_window(
                        "Confirmación",
                        vec![
                            FakeControl::new(
                                "Static",
                                "La versión de la Base de datos de la empresa no coincide",
                            ),
                            FakeControl::new("Button", "&No"),
                        ],
                    );
                }
            });
            state.on_click("&No", |window, state| state.close_window(window));
        });

        let outcome = open_company(&host.desktop(), "Beta SA").unwrap();
        assert_eq!(outcome, DialogOutcome::Failed(VERSION_INCOMPATIBLE.to_string()));
    }

    #[test]
    fn unknown_company_is_reported_without_activation() {
        let (host, _, _) = host_with_catalog();
        let err = open_company(&host.desktop(), "Gamma SA").unwrap_err();
        assert!(matches!(err, AutomationError::ControlMissing(_)));
        assert!(host.desktop.events().is_empty());
    }

    #[test]
    fn closing_waits_for_title_without_company() {
        let host = Host::new();
        let main = host.desktop.open_window(OPENED, vec![]);
        host.desktop.edit(move |state| {
            state.on(move |event, state| {
                if matches!(event, Event::Menu { .. }) {
                    state.schedule_in(Duration::from_secs(2), move |state| {
                        state.window_mut(main).title = MAIN.to_string();
                    });
                }
            });
        });

        close_company(&host.desktop()).unwrap();

        assert_eq!(
            host.desktop.events()[0],
            Event::Menu {
                window: main,
                path: CLOSE_COMPANY_MENU.to_string()
            }
        );
        assert!(host.clock.elapsed() >= Duration::from_secs(2));
    }
}
