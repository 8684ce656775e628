//! Application catalog: which apps exist and who may launch them.

use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet, HashMap},
    rc::Rc,
};

use desktop_app_contract::{ApplicationId, TeamContext, TeamId};

use crate::{error::DesktopError, model::ApplicationDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Behavior when registering an id that already exists.
pub enum RegisterMode {
    /// Fail with [`DesktopError::DuplicateId`].
    Reject,
    /// Swap in the new descriptor.
    Replace,
}

#[derive(Default)]
struct RegistryState {
    descriptors: BTreeMap<String, Rc<ApplicationDescriptor>>,
    installations: HashMap<TeamId, BTreeSet<String>>,
}

#[derive(Clone, Default)]
/// Shared handle to the descriptor catalog. The registry is the only owner of descriptors; other
/// components receive read-only `Rc` snapshots.
pub struct AppRegistry {
    inner: Rc<RefCell<RegistryState>>,
}

impl AppRegistry {
    /// Registers a new descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`DesktopError::DuplicateId`] when the id exists, or
    /// [`DesktopError::InvalidDescriptor`] naming the first malformed field.
    pub fn register(&self, descriptor: ApplicationDescriptor) -> Result<(), DesktopError> {
        self.register_with(descriptor, RegisterMode::Reject)
            .map(|_| ())
    }

    /// Registers a descriptor, replacing any previous entry with the same id.
    ///
    /// Returns the replaced descriptor, if any.
    ///
    /// # Errors
    ///
    /// Returns [`DesktopError::InvalidDescriptor`] naming the first malformed field.
    pub fn register_or_replace(
        &self,
        descriptor: ApplicationDescriptor,
    ) -> Result<Option<Rc<ApplicationDescriptor>>, DesktopError> {
        self.register_with(descriptor, RegisterMode::Replace)
    }

    /// Registers a descriptor under an explicit duplicate policy.
    ///
    /// # Errors
    ///
    /// See [`AppRegistry::register`].
    pub fn register_with(
        &self,
        descriptor: ApplicationDescriptor,
        mode: RegisterMode,
    ) -> Result<Option<Rc<ApplicationDescriptor>>, DesktopError> {
        validate_descriptor(&descriptor)?;
        let mut state = self.inner.borrow_mut();
        let key = descriptor.id.as_str().to_string();
        if mode == RegisterMode::Reject && state.descriptors.contains_key(&key) {
            return Err(DesktopError::DuplicateId(descriptor.id));
        }
        let replaced = state.descriptors.insert(key, Rc::new(descriptor));
        if let Some(previous) = &replaced {
            tracing::debug!("replaced descriptor `{}`", previous.id);
        }
        Ok(replaced)
    }

    /// Uninstalls a descriptor everywhere, including every team installation.
    ///
    /// # Errors
    ///
    /// Returns [`DesktopError::NotFound`] when no descriptor has this id.
    pub fn unregister(&self, id: &str) -> Result<Rc<ApplicationDescriptor>, DesktopError> {
        let mut state = self.inner.borrow_mut();
        let removed = state
            .descriptors
            .remove(id)
            .ok_or_else(|| DesktopError::NotFound(id.to_string()))?;
        for installed in state.installations.values_mut() {
            installed.remove(id);
        }
        state.installations.retain(|_, installed| !installed.is_empty());
        Ok(removed)
    }

    /// Looks up a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`DesktopError::NotFound`] when no descriptor has this id.
    pub fn get(&self, id: &str) -> Result<Rc<ApplicationDescriptor>, DesktopError> {
        self.inner
            .borrow()
            .descriptors
            .get(id)
            .cloned()
            .ok_or_else(|| DesktopError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.borrow().descriptors.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks a registered descriptor as installed for `team`.
    ///
    /// # Errors
    ///
    /// Returns [`DesktopError::NotFound`] when no descriptor has this id.
    pub fn install_for_team(&self, team: &TeamId, id: &str) -> Result<(), DesktopError> {
        let mut state = self.inner.borrow_mut();
        if !state.descriptors.contains_key(id) {
            return Err(DesktopError::NotFound(id.to_string()));
        }
        state
            .installations
            .entry(team.clone())
            .or_default()
            .insert(id.to_string());
        Ok(())
    }

    /// Removes a team installation. Returns `false` when it did not exist.
    pub fn uninstall_for_team(&self, team: &TeamId, id: &str) -> bool {
        let mut state = self.inner.borrow_mut();
        let Some(installed) = state.installations.get_mut(team) else {
            return false;
        };
        let removed = installed.remove(id);
        if installed.is_empty() {
            state.installations.remove(team);
        }
        removed
    }

    pub fn is_installed_for(&self, team: &TeamId, id: &str) -> bool {
        self.inner
            .borrow()
            .installations
            .get(team)
            .is_some_and(|installed| installed.contains(id))
    }

    /// Team-scoping half of the visibility rule: team-agnostic descriptors are always valid,
    /// team-scoped ones only inside a team that installed them.
    pub fn is_valid_for_team(
        &self,
        descriptor: &ApplicationDescriptor,
        context: &TeamContext,
    ) -> bool {
        if !descriptor.team_scoped {
            return true;
        }
        context
            .team_id
            .as_ref()
            .is_some_and(|team| self.is_installed_for(team, descriptor.id.as_str()))
    }

    /// Full visibility rule: valid for the team and every required capability granted.
    pub fn is_available_for(
        &self,
        descriptor: &ApplicationDescriptor,
        context: &TeamContext,
    ) -> bool {
        self.is_valid_for_team(descriptor, context)
            && context.grants_all(&descriptor.required_capabilities)
    }

    /// Looks up `id` and applies the visibility rule.
    ///
    /// # Errors
    ///
    /// Returns [`DesktopError::NotFound`] when no descriptor has this id.
    pub fn is_available(&self, id: &str, context: &TeamContext) -> Result<bool, DesktopError> {
        let descriptor = self.get(id)?;
        Ok(self.is_available_for(&descriptor, context))
    }

    /// Descriptors `context` may launch, ordered by category, then display name.
    pub fn resolve_available(&self, context: &TeamContext) -> Vec<Rc<ApplicationDescriptor>> {
        let all: Vec<_> = self.inner.borrow().descriptors.values().cloned().collect();
        let mut visible: Vec<_> = all
            .into_iter()
            .filter(|descriptor| self.is_available_for(descriptor, context))
            .collect();
        visible.sort_by(|a, b| {
            a.category
                .cmp(&b.category)
                .then_with(|| a.display_name.cmp(&b.display_name))
                .then_with(|| a.id.cmp(&b.id))
        });
        visible
    }

    /// Descriptors flagged for preloading, in id order.
    pub fn critical_apps(&self) -> Vec<ApplicationId> {
        self.inner
            .borrow()
            .descriptors
            .values()
            .filter(|descriptor| descriptor.critical)
            .map(|descriptor| descriptor.id.clone())
            .collect()
    }
}

fn validate_descriptor(descriptor: &ApplicationDescriptor) -> Result<(), DesktopError> {
    ApplicationId::new(descriptor.id.as_str()).map_err(|reason| invalid("id", reason))?;
    if descriptor.display_name.trim().is_empty() {
        return Err(invalid("display_name", "must not be blank"));
    }
    if descriptor.module_ref.trim().is_empty() {
        return Err(invalid("module_ref", "must not be blank"));
    }
    if descriptor.category.trim().is_empty() {
        return Err(invalid("category", "must not be blank"));
    }
    if descriptor
        .required_capabilities
        .iter()
        .any(|capability| capability.trim().is_empty())
    {
        return Err(invalid(
            "required_capabilities",
            "capability names must not be blank",
        ));
    }

    let window = &descriptor.default_window;
    if window.rect.w <= 0 {
        return Err(invalid("default_window.width", "must be positive"));
    }
    if window.rect.h <= 0 {
        return Err(invalid("default_window.height", "must be positive"));
    }
    if window.min_width <= 0 || window.min_width > window.rect.w {
        return Err(invalid(
            "default_window.min_width",
            "must be positive and at most the default width",
        ));
    }
    if window.min_height <= 0 || window.min_height > window.rect.h {
        return Err(invalid(
            "default_window.min_height",
            "must be positive and at most the default height",
        ));
    }
    Ok(())
}

fn invalid(field: &'static str, reason: impl Into<String>) -> DesktopError {
    DesktopError::InvalidDescriptor {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::DefaultWindowOptions;

    fn descriptor(id: &str, name: &str, category: &str) -> ApplicationDescriptor {
        ApplicationDescriptor::new(ApplicationId::trusted(id), name, format!("apps/{id}"))
            .in_category(category)
    }

    fn ids(descriptors: &[Rc<ApplicationDescriptor>]) -> Vec<&str> {
        descriptors.iter().map(|d| d.id.as_str()).collect()
    }

    #[test]
    fn duplicate_ids_are_rejected_unless_replacing() {
        let registry = AppRegistry::default();
        registry
            .register(descriptor("calc", "Calculator", "tools"))
            .expect("first registration");

        let err = registry
            .register(descriptor("calc", "Calc 2", "tools"))
            .expect_err("duplicate");
        assert_eq!(err, DesktopError::DuplicateId(ApplicationId::trusted("calc")));

        let replaced = registry
            .register_or_replace(descriptor("calc", "Calc 2", "tools"))
            .expect("replace")
            .expect("previous entry");
        assert_eq!(replaced.display_name, "Calculator");
        assert_eq!(registry.get("calc").expect("get").display_name, "Calc 2");
    }

    #[test]
    fn replacement_leaves_earlier_snapshots_untouched() {
        let registry = AppRegistry::default();
        registry
            .register(descriptor("calc", "Calculator", "tools"))
            .expect("register");
        let snapshot = registry.get("calc").expect("get");
        registry
            .register_or_replace(descriptor("calc", "Renamed", "tools"))
            .expect("replace");
        assert_eq!(snapshot.display_name, "Calculator");
    }

    #[test]
    fn missing_ids_report_not_found() {
        let registry = AppRegistry::default();
        assert_eq!(
            registry.get("missing").expect_err("absent"),
            DesktopError::NotFound("missing".to_string())
        );
        assert!(registry.unregister("missing").is_err());
    }

    #[test]
    fn malformed_descriptors_name_the_offending_field() {
        let registry = AppRegistry::default();
        let cases = [
            (
                ApplicationDescriptor::new(ApplicationId::trusted("Bad Id"), "X", "apps/x"),
                "id",
            ),
            (descriptor("blank", "  ", "tools"), "display_name"),
            (
                ApplicationDescriptor::new(ApplicationId::trusted("noref"), "No ref", ""),
                "module_ref",
            ),
            (descriptor("nocat", "No category", ""), "category"),
            (
                descriptor("caps", "Caps", "tools").requires(" "),
                "required_capabilities",
            ),
            (
                descriptor("tiny", "Tiny", "tools").with_default_window(DefaultWindowOptions {
                    min_width: 900,
                    ..DefaultWindowOptions::default()
                }),
                "default_window.min_width",
            ),
        ];

        for (candidate, expected_field) in cases {
            match registry.register(candidate) {
                Err(DesktopError::InvalidDescriptor { field, .. }) => {
                    assert_eq!(field, expected_field)
                }
                other => panic!("expected invalid `{expected_field}`, got {other:?}"),
            }
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn resolve_available_filters_by_team_and_capabilities_and_sorts() {
        let registry = AppRegistry::default();
        registry
            .register(descriptor("notes", "Notes", "productivity"))
            .expect("notes");
        registry
            .register(descriptor("calc", "Calculator", "tools"))
            .expect("calc");
        registry
            .register(descriptor("billing", "Billing", "admin").requires("billing.manage"))
            .expect("billing");
        registry
            .register(descriptor("shop", "Shop Orders", "commerce").team_scoped())
            .expect("shop");
        registry
            .register(descriptor("archive", "Archive", "productivity"))
            .expect("archive");

        let team_a = TeamId::new("a");
        registry.install_for_team(&team_a, "shop").expect("install");

        let anonymous = TeamContext::default();
        assert_eq!(
            ids(&registry.resolve_available(&anonymous)),
            vec!["archive", "notes", "calc"]
        );

        let admin_in_a = TeamContext::for_team("a").with_capabilities(["billing.manage"]);
        assert_eq!(
            ids(&registry.resolve_available(&admin_in_a)),
            vec!["billing", "shop", "archive", "notes", "calc"]
        );

        let in_b = TeamContext::for_team("b");
        assert!(!registry.is_available("shop", &in_b).expect("shop exists"));
    }

    #[test]
    fn unregister_drops_team_installations() {
        let registry = AppRegistry::default();
        registry
            .register(descriptor("shop", "Shop", "commerce").team_scoped())
            .expect("shop");
        let team = TeamId::new("a");
        registry.install_for_team(&team, "shop").expect("install");

        registry.unregister("shop").expect("unregister");
        assert!(!registry.is_installed_for(&team, "shop"));

        registry
            .register(descriptor("shop", "Shop", "commerce").team_scoped())
            .expect("re-register");
        assert!(!registry.is_installed_for(&team, "shop"));
    }

    #[test]
    fn critical_apps_lists_flagged_descriptors() {
        let registry = AppRegistry::default();
        registry
            .register(descriptor("files", "Files", "system").critical())
            .expect("files");
        registry
            .register(descriptor("calc", "Calculator", "tools"))
            .expect("calc");
        assert_eq!(
            registry.critical_apps(),
            vec![ApplicationId::trusted("files")]
        );
    }
}
