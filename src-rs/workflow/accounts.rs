//! Reference-data resolution inside the posting window: when the target
//! application asks for client, supplier or product updates, the matching
//! ledger account is typed and assigned before advancing.

use std::time::Duration;

use crate::clock::secs;
use crate::data::{AccountKind, DataAccess, DataError};
use crate::error::{AutomationError, Result};
use crate::matcher::{Affordance, ADVANCED_CONFIDENCE};
use crate::primitives::{poll_until, wait_for_element};
use crate::surface::ControlHandle;

use super::posting::UpdateKind;
use super::Desktop;

pub const CLIENT_UPDATE: &str = "Actualizar clientes";
pub const SUPPLIER_UPDATE: &str = "Actualizar proveedores";
pub const PRODUCT_UPDATE: &str = "Actualizar productos y servicios sat";
pub const NEXT_STEP: &str = " Siguiente ";
pub const FORWARD: &str = "&Siguiente";
pub const ASSIGN: &str = "Asignar";
pub const GENERATE: &str = "&Generar pólizas";
pub const ACCOUNT_FIELD: &str = "000-00-000";
pub const WARNING_TITLE: &str = "Advertencia";

const STEP_WAIT: Duration = Duration::from_secs(10);
const STEP_POLL: Duration = Duration::from_millis(250);
const WARNING_WAIT: Duration = Duration::from_secs(2);
const WARNING_POLL: Duration = Duration::from_millis(250);
const MAX_DEPTH: u32 = 1;

impl UpdateKind {
    /// Order in which pending updates are looked for.
    pub const ALL: [UpdateKind; 3] = [
        UpdateKind::ClientUpdate,
        UpdateKind::SupplierUpdate,
        UpdateKind::ProductUpdate,
    ];

    pub fn button_title(self) -> &'static str {
        match self {
            Self::ClientUpdate => CLIENT_UPDATE,
            Self::SupplierUpdate => SUPPLIER_UPDATE,
            Self::ProductUpdate => PRODUCT_UPDATE,
        }
    }

    pub fn affordance(self) -> Affordance {
        match self {
            Self::ClientUpdate => Affordance::UpdateClients,
            Self::SupplierUpdate => Affordance::UpdateSuppliers,
            Self::ProductUpdate => Affordance::UpdateProducts,
        }
    }

    /// Ledger account typed for this update; products take none.
    pub fn account(self) -> Option<AccountKind> {
        match self {
            Self::ClientUpdate => Some(AccountKind::Client),
            Self::SupplierUpdate => Some(AccountKind::Supplier),
            Self::ProductUpdate => None,
        }
    }
}

pub struct AccountResolver<'a> {
    desktop: Desktop<'a>,
    data: &'a dyn DataAccess,
    window: ControlHandle,
    alias: &'a str,
}

impl<'a> AccountResolver<'a> {
    pub fn new(
        desktop: Desktop<'a>,
        data: &'a dyn DataAccess,
        window: ControlHandle,
        alias: &'a str,
    ) -> Self {
        Self {
            desktop,
            data,
            window,
            alias,
        }
    }

    pub fn resolve(&self, kind: UpdateKind) -> Result<()> {
        self.resolve_at(kind, 0)
    }

    fn resolve_at(&self, kind: UpdateKind, depth: u32) -> Result<()> {
        log::info!("[accounts] resolving '{}' (depth {depth})", kind.button_title());
        let keys = self.account_keys(kind)?;
        self.focus_account_field()?;
        self.enter_keys(&keys)?;
        self.assign()?;
        self.desktop.ui.click(&self.window.button(kind.button_title()))?;

        if depth < MAX_DEPTH {
            match kind {
                UpdateKind::ClientUpdate => self.follow_with_products(depth),
                UpdateKind::ProductUpdate => self.follow_with_parties(depth),
                UpdateKind::SupplierUpdate => {}
            }
        }

        let next = self.window.button(NEXT_STEP);
        wait_for_element(self.desktop.ui, self.desktop.clock, &next, STEP_WAIT, STEP_POLL)?;
        self.desktop.ui.click(&next)?;
        log::info!("[accounts] '{}' done", kind.button_title());
        Ok(())
    }

    fn account_keys(&self, kind: UpdateKind) -> Result<String> {
        let Some(account) = kind.account() else {
            return Ok("{F3}".to_string());
        };
        let check = self.data.account_code_for_company(self.alias, account)?;
        let code = check
            .code
            .filter(|code| !code.trim().is_empty())
            .ok_or_else(|| {
                DataError::Missing(format!("{} account code of {}", account.label(), self.alias))
            })?;
        log::info!("[accounts] {} account for {}: {code}", account.label(), self.alias);
        Ok(format!("{{F3}}{}", code.trim()))
    }

    /// The account icon, or else the second `000-00-000` edit field.
    fn focus_account_field(&self) -> Result<()> {
        let ui = self.desktop.ui;
        ui.focus(&self.window)?;
        if self.desktop.click_image(Affordance::AccountField) {
            return Ok(());
        }
        log::warn!("[accounts] account icon not found; falling back to the edit field");
        let field = self.window.child(Some("Edit"), Some(ACCOUNT_FIELD)).nth(1);
        if !ui.exists(&field)? {
            return Err(AutomationError::ControlMissing(field.to_string()));
        }
        ui.focus(&field)?;
        self.desktop.pause(Duration::from_secs(1));
        ui.click(&field)
    }

    fn enter_keys(&self, keys: &str) -> Result<()> {
        let ui = self.desktop.ui;
        ui.focus(&self.window)?;
        self.desktop.pause(Duration::from_secs(1));
        ui.type_text(&self.window, keys)?;
        self.desktop.pause(Duration::from_secs(1));
        ui.type_text(&self.window, "{ENTER}")
    }

    fn assign(&self) -> Result<()> {
        let assign = self.window.button(ASSIGN);
        wait_for_element(self.desktop.ui, self.desktop.clock, &assign, STEP_WAIT, STEP_POLL)?;
        self.desktop.ui.click(&assign)?;
        self.desktop.pause(Duration::from_secs(1));
        self.handle_warning();
        self.desktop.pause(Duration::from_secs(1));
        Ok(())
    }

    fn handle_warning(&self) {
        let locator = self.desktop.locator();
        let shown = poll_until(self.desktop.clock, WARNING_WAIT, WARNING_POLL, || {
            locator.is_top_window_with_title(WARNING_TITLE).then_some(())
        });
        if shown.is_none() {
            return;
        }
        if let Some(outcome) = self.desktop.dialogs().handle_foreground() {
            log::info!("[accounts] warning after assign: {outcome:?}");
        }
    }

    fn follow_with_products(&self, depth: u32) {
        let (clicked, _) = self.desktop.matcher().find_and_click_image_advanced(
            Affordance::UpdateProducts,
            ADVANCED_CONFIDENCE,
            true,
        );
        if !clicked {
            log::error!("[accounts] products update icon not found");
        }
        self.desktop.pause(secs(1.0));
        let products = self.window.button(PRODUCT_UPDATE);
        let visible = self.desktop.ui.exists(&products).unwrap_or(false)
            && self.desktop.ui.is_visible(&products).unwrap_or(false);
        if !visible {
            return;
        }
        if let Err(err) = self.resolve_at(UpdateKind::ProductUpdate, depth + 1) {
            log::error!("[accounts] products update failed: {err}");
        }
    }

    fn follow_with_parties(&self, depth: u32) {
        let mut resolved = 0;
        for kind in [UpdateKind::ClientUpdate, UpdateKind::SupplierUpdate] {
            let (clicked, _) = self.desktop.matcher().find_and_click_image_advanced(
                kind.affordance(),
                ADVANCED_CONFIDENCE,
                true,
            );
            if !clicked {
                continue;
            }
            match self.resolve_at(kind, depth + 1) {
                Ok(()) => resolved += 1,
                Err(err) => log::error!("[accounts] '{}' failed: {err}", kind.button_title()),
            }
        }
        if resolved < 2 {
            log::warn!("[accounts] {resolved} of 2 party updates done after products");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{Event, FakeControl, FakeData};
    use crate::workflow::fixtures::Host;

    fn posting_window(host: &Host) -> u64 {
        host.desktop.open_window(
            "Contabilizar CFDI",
            vec![
                FakeControl::new("Edit", ""),
                FakeControl::new("Edit", ACCOUNT_FIELD),
                FakeControl::new("Edit", ACCOUNT_FIELD),
                FakeControl::new("Button", ASSIGN),
                FakeControl::new("Button", NEXT_STEP),
                FakeControl::new("Button", SUPPLIER_UPDATE),
            ],
        )
    }

    fn typed(host: &Host) -> Vec<String> {
        host.desktop
            .events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Type { keys, .. } => Some(keys),
                _ => None,
            })
            .collect()
    }

    fn clicked(host: &Host) -> Vec<String> {
        host.desktop
            .events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Click { control, .. } => Some(control),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn supplier_update_types_account_and_advances() {
        let host = Host::new();
        host.show(Affordance::AccountField);
        let hwnd = posting_window(&host);
        let data = FakeData::new().company(1, "Alpha SA", "ctAlpha", true, true);

        let resolver = AccountResolver::new(
            host.desktop(),
            &data,
            ControlHandle::window(crate::surface::WindowSelector::Handle(hwnd)),
            "ctAlpha",
        );
        resolver.resolve(UpdateKind::SupplierUpdate).unwrap();

        assert_eq!(typed(&host), vec!["{F3}201-01-000", "{ENTER}"]);
        assert_eq!(clicked(&host), vec![ASSIGN, SUPPLIER_UPDATE, NEXT_STEP]);
        assert_eq!(data.calls(), vec!["supplier:ctAlpha"]);
        assert!(host
            .desktop
            .events()
            .iter()
            .any(|e| matches!(e, Event::PointerClick { double: false, .. })));
    }

    #[test]
    fn missing_icon_falls_back_to_second_account_field() {
        let host = Host::new();
        host.hide(Affordance::AccountField);
        let hwnd = posting_window(&host);
        let data = FakeData::new().company(1, "Alpha SA", "ctAlpha", true, true);
        let window = ControlHandle::window(crate::surface::WindowSelector::Handle(hwnd));

        AccountResolver::new(host.desktop(), &data, window, "ctAlpha")
            .resolve(UpdateKind::SupplierUpdate)
            .unwrap();

        assert_eq!(clicked(&host)[0], ACCOUNT_FIELD);
    }

    #[test]
    fn warning_after_assign_is_acknowledged() {
        let host = Host::new();
        host.show(Affordance::AccountField);
        let hwnd = posting_window(&host);
        host.desktop.edit(|state| {
            state.on_click(ASSIGN, |_, state| {
                state.open_window(
                    WARNING_TITLE,
                    vec![
                        FakeControl::new(
                            "Static",
                            "El número de cuentas de clientes / proveedores que desea crear es alto",
                        ),
                        FakeControl::new("Button", "&Aceptar"),
                    ],
                );
            });
            state.on_click("&Aceptar", |window, state| state.close_window(window));
        });
        let data = FakeData::new().company(1, "Alpha SA", "ctAlpha", true, true);
        let window = ControlHandle::window(crate::surface::WindowSelector::Handle(hwnd));

        AccountResolver::new(host.desktop(), &data, window, "ctAlpha")
            .resolve(UpdateKind::SupplierUpdate)
            .unwrap();

        assert_eq!(clicked(&host), vec![ASSIGN, "&Aceptar", SUPPLIER_UPDATE, NEXT_STEP]);
        assert!(!host.desktop.edit(|state| state.has_window(WARNING_TITLE)));
    }

    #[test]
    fn invalid_account_code_stops_before_typing() {
        let host = Host::new();
        let hwnd = posting_window(&host);
        let mut data = FakeData::new().company(1, "Alpha SA", "ctAlpha", true, true);
        let key = ("ctAlpha".to_string(), AccountKind::Supplier);
        if let Some(check) = data.accounts.get_mut(&key) {
            check.code = None;
        }
        let window = ControlHandle::window(crate::surface::WindowSelector::Handle(hwnd));

        let err = AccountResolver::new(host.desktop(), &data, window, "ctAlpha")
            .resolve(UpdateKind::SupplierUpdate)
            .unwrap_err();
        assert!(matches!(err, AutomationError::Data(DataError::Missing(_))));
        assert!(typed(&host).is_empty());
    }

    #[test]
    fn update_kinds_map_to_buttons_and_accounts() {
        assert_eq!(UpdateKind::ProductUpdate.account(), None);
        assert_eq!(UpdateKind::ClientUpdate.account(), Some(AccountKind::Client));
        assert_eq!(UpdateKind::SupplierUpdate.affordance(), Affordance::UpdateSuppliers);
        assert_eq!(UpdateKind::ALL.map(UpdateKind::button_title)[2], PRODUCT_UPDATE);
    }
}
