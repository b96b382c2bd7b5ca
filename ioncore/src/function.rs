//! Functions : unités de comportement à cycle de vie.
//!
//! Une Function détient ses propriétés pour toute sa durée de vie ;
//! l'indice d'une propriété dans le tableau est stable. Toute mutation
//! passe par le point d'entrée unique [`Function::write_property`], qui
//! applique les drapeaux, horodate, notifie le hook et persiste.

use chrono::{DateTime, Utc};
use ionconfig::Store;
use ionhttp::SharedHttpEngine;
use tracing::{debug, warn};

use crate::property::{FLAG_LOCK_LABEL, FLAG_VOLATILE, Property};

/// Longueur maximale d'une étiquette de Function.
pub const FUNCTION_MAX_LABEL: usize = 48;

/// État du cycle de vie d'une Function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionState {
    Stopped,
    Running,
    Error,
}

/// Contexte passé aux Functions à chaque étape du cycle de vie.
///
/// Remplace les singletons globaux du firmware d'origine : magasin d'état,
/// moteur HTTP partagé, identité réseau.
#[derive(Clone)]
pub struct ServiceContext {
    pub store: Store,
    pub http: SharedHttpEngine,
    pub http_port: u16,
    pub local_ip: String,
}

/// Noyau commun à toutes les Functions : tag, étiquette, état, drapeaux et
/// tableau de propriétés.
pub struct FunctionCore {
    tag: String,
    label: Option<String>,
    state: FunctionState,
    flags: u16,
    props: Vec<Property>,
}

impl FunctionCore {
    pub fn new(tag: &str, props: Vec<Property>) -> Self {
        debug!(tag, "Created function ({} properties)", props.len());

        Self {
            tag: tag.to_string(),
            label: None,
            state: FunctionState::Stopped,
            flags: 0,
            props,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn state(&self) -> FunctionState {
        self.state
    }

    pub fn set_state(&mut self, state: FunctionState) {
        self.state = state;
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn insert_flag(&mut self, flag: u16) {
        self.flags |= flag;
    }

    pub fn remove_flag(&mut self, flag: u16) {
        self.flags &= !flag;
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or("")
    }

    /// Change l'étiquette et la persiste, sauf étiquette verrouillée.
    pub fn set_label(&mut self, label: &str, lock: bool, store: Option<&Store>) {
        if self.has_flag(FLAG_LOCK_LABEL) {
            return;
        }

        if label.is_empty() {
            self.label = None;
        } else {
            let mut label = label.to_string();
            label.truncate(FUNCTION_MAX_LABEL);
            if !lock {
                if let Some(store) = store {
                    store.set(&self.tag, "Label", &label);
                }
            }
            self.label = Some(label);
        }

        if lock {
            self.insert_flag(FLAG_LOCK_LABEL);
        }
    }

    pub fn properties(&self) -> &[Property] {
        &self.props
    }

    pub fn property(&self, index: usize) -> Option<&Property> {
        self.props.get(index)
    }

    pub fn property_mut(&mut self, index: usize) -> Option<&mut Property> {
        self.props.get_mut(index)
    }

    /// Lecture rendue d'une propriété ; chaîne vide hors bornes.
    pub fn read_property(&self, index: usize) -> String {
        self.props.get(index).map(|p| p.render()).unwrap_or_default()
    }

    /// Applique une écriture : refusée si READ_ONLY, horodatée si changée.
    /// Retourne `None` pour un refus, `Some(changed)` sinon.
    pub(crate) fn apply_write(&mut self, index: usize, raw: &str) -> Option<bool> {
        let prop = self.props.get_mut(index)?;
        if prop.is_read_only() {
            return None;
        }

        let changed = prop.apply(raw);
        if changed {
            prop.set_timestamp(Utc::now());
        }
        Some(changed)
    }

    /// Écriture d'initialisation : contourne READ_ONLY et le hook, pour
    /// les valeurs forgées au démarrage (identités générées).
    pub fn initialize_property(&mut self, index: usize, raw: &str) -> bool {
        let Some(prop) = self.props.get_mut(index) else {
            return false;
        };

        let changed = prop.apply(raw);
        if changed {
            prop.set_timestamp(Utc::now());
        }
        changed
    }

    /// Persiste valeur et horodatage d'une propriété, sauf VOLATILE.
    pub fn persist_property(&self, index: usize, store: &Store) {
        let Some(prop) = self.props.get(index) else {
            return;
        };

        if prop.has_flag(FLAG_VOLATILE) {
            debug!(tag = %self.tag, "Volatile property {}, save ignored", index);
            return;
        }

        store.set(&self.tag, &value_key(index), &prop.render());
        if let Some(ts) = prop.timestamp() {
            store.set_i64(&self.tag, &time_key(index), ts.timestamp());
        }

        debug!(tag = %self.tag, "Saved property {} ({})", index, prop.render());
    }

    /// Recharge étiquettes, horodatages et valeurs depuis le magasin.
    pub fn load_persisted(&mut self, store: &Store) {
        if !self.has_flag(FLAG_LOCK_LABEL) {
            if let Some(label) = store.get(&self.tag, "Label") {
                debug!(tag = %self.tag, "Loaded label: {}", label);
                self.label = Some(label);
            }
        }

        for (index, prop) in self.props.iter_mut().enumerate() {
            if !prop.has_flag(FLAG_LOCK_LABEL) {
                if let Some(label) = store.get(&self.tag, &label_key(index)) {
                    prop.set_label(&label, false);
                }
            }

            if let Some(secs) = store.get_i64(&self.tag, &time_key(index)) {
                if let Some(ts) = DateTime::<Utc>::from_timestamp(secs, 0) {
                    prop.set_timestamp(ts);
                }
            }

            if let Some(value) = store.get(&self.tag, &value_key(index)) {
                prop.load(&value);
                debug!(tag = %self.tag, "Loaded property {} ({})", index, value);
            }
        }
    }

    /// Persiste aussi l'étiquette d'une propriété (changement d'étiquette
    /// à chaud, hors chemin de valeur).
    pub fn persist_property_label(&self, index: usize, store: &Store) {
        if let Some(prop) = self.props.get(index) {
            if !prop.label().is_empty() {
                store.set(&self.tag, &label_key(index), prop.label());
            }
        }
    }
}

fn value_key(index: usize) -> String {
    format!("Value@P{:03}", index)
}

fn time_key(index: usize) -> String {
    format!("Time@P{:03}", index)
}

fn label_key(index: usize) -> String {
    format!("Label@P{:03}", index)
}

/// Comportement d'une Function enregistrable auprès du Master.
pub trait Function: Send {
    fn core(&self) -> &FunctionCore;
    fn core_mut(&mut self) -> &mut FunctionCore;

    fn start(&mut self, ctx: &ServiceContext);
    fn stop(&mut self, ctx: &ServiceContext);
    fn service(&mut self, ctx: &ServiceContext);

    /// Hook notifié après un changement de propriété. Retourner vrai pour
    /// laisser la persistance se faire.
    fn on_property_update(&mut self, index: usize, urgent: bool) -> bool {
        let _ = (index, urgent);
        true
    }

    /// Point d'entrée unique de mutation d'une propriété.
    ///
    /// Refuse les écritures sur READ_ONLY, horodate au changement, notifie
    /// le hook, puis persiste valeur et horodatage (sauf VOLATILE).
    /// `urgent` signale au hook qu'une réaction hors-bande est attendue ;
    /// le cheminement reste identique.
    fn write_property(&mut self, index: usize, raw: &str, urgent: bool, store: &Store) -> bool {
        let changed = match self.core_mut().apply_write(index, raw) {
            Some(changed) => changed,
            None => return false,
        };

        if changed && self.on_property_update(index, urgent) {
            self.core().persist_property(index, store);
        }

        changed
    }
}

impl std::fmt::Debug for dyn Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("tag", &self.core().tag())
            .finish()
    }
}

/// Trace un démarrage qui n'a pas abouti.
pub(crate) fn warn_if_not_running(core: &FunctionCore) {
    if core.state() != FunctionState::Running {
        warn!(tag = %core.tag(), "ERROR starting: state: {:?}", core.state());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{FLAG_READ_ONLY as RO, PropertyClass};
    use std::fs;

    fn temp_store(name: &str) -> Store {
        let dir = std::env::temp_dir().join(format!("ioncore-{}-{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let _ = fs::remove_file(dir.join("state.yaml"));
        Store::open(dir.to_str().unwrap()).unwrap()
    }

    /// Function d'essai : compte les notifications du hook.
    struct Probe {
        core: FunctionCore,
        updates: Vec<(usize, bool)>,
    }

    impl Probe {
        fn new(tag: &str, props: Vec<Property>) -> Self {
            Self {
                core: FunctionCore::new(tag, props),
                updates: Vec::new(),
            }
        }
    }

    impl Function for Probe {
        fn core(&self) -> &FunctionCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut FunctionCore {
            &mut self.core
        }

        fn start(&mut self, _ctx: &ServiceContext) {
            self.core.set_state(FunctionState::Running);
        }

        fn stop(&mut self, _ctx: &ServiceContext) {
            self.core.set_state(FunctionState::Stopped);
        }

        fn service(&mut self, _ctx: &ServiceContext) {}

        fn on_property_update(&mut self, index: usize, urgent: bool) -> bool {
            self.updates.push((index, urgent));
            true
        }
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let store = temp_store("roundtrip");
        let mut f = Probe::new(
            "probe",
            vec![Property::boolean(0, PropertyClass::Switch, false)],
        );

        assert!(f.write_property(0, "On", false, &store));
        assert_eq!(f.core().read_property(0), "On");
        assert_eq!(f.updates, vec![(0, false)]);
    }

    #[test]
    fn test_read_only_write_is_noop() {
        let store = temp_store("readonly");
        let mut f = Probe::new(
            "probe",
            vec![Property::text(RO, PropertyClass::Generic, "fixed", 16)],
        );

        assert!(!f.write_property(0, "other", false, &store));
        assert_eq!(f.core().read_property(0), "fixed");
        assert!(f.updates.is_empty());
    }

    #[test]
    fn test_unchanged_write_skips_hook() {
        let store = temp_store("unchanged");
        let mut f = Probe::new(
            "probe",
            vec![Property::text(0, PropertyClass::Generic, "same", 16)],
        );

        assert!(!f.write_property(0, "same", false, &store));
        assert!(f.updates.is_empty());
    }

    #[test]
    fn test_write_sets_timestamp() {
        let store = temp_store("stamp");
        let mut f = Probe::new(
            "probe",
            vec![Property::text(0, PropertyClass::Generic, "", 16)],
        );

        assert!(f.core().property(0).unwrap().timestamp().is_none());
        f.write_property(0, "x", false, &store);
        assert!(f.core().property(0).unwrap().timestamp().is_some());
    }

    #[test]
    fn test_persist_and_reload() {
        let store = temp_store("persist");
        let mut f = Probe::new(
            "probe",
            vec![Property::int(0, PropertyClass::Brightness, 0, 0, 100)],
        );
        f.write_property(0, "42", false, &store);

        let mut fresh = Probe::new(
            "probe",
            vec![Property::int(0, PropertyClass::Brightness, 0, 0, 100)],
        );
        fresh.core_mut().load_persisted(&store);
        assert_eq!(fresh.core().read_property(0), "42");
        assert!(fresh.core().property(0).unwrap().timestamp().is_some());
    }

    #[test]
    fn test_volatile_not_persisted() {
        let store = temp_store("volatile");
        let mut f = Probe::new(
            "probe",
            vec![Property::text(
                FLAG_VOLATILE,
                PropertyClass::Generic,
                "",
                16,
            )],
        );
        f.write_property(0, "ephemeral", false, &store);

        let mut fresh = Probe::new(
            "probe",
            vec![Property::text(
                FLAG_VOLATILE,
                PropertyClass::Generic,
                "",
                16,
            )],
        );
        fresh.core_mut().load_persisted(&store);
        assert_eq!(fresh.core().read_property(0), "");
    }

    #[test]
    fn test_urgent_forwarded_to_hook() {
        let store = temp_store("urgent");
        let mut f = Probe::new(
            "probe",
            vec![Property::boolean(0, PropertyClass::Relay, false)],
        );
        f.write_property(0, "Closed", true, &store);
        assert_eq!(f.updates, vec![(0, true)]);
    }
}
