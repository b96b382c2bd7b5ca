//! Master : racine du registre de Functions.
//!
//! Le Master détient la liste ordonnée des Functions, le moteur HTTP
//! partagé et les propriétés d'identité réseau (identifiants WiFi, nom
//! d'hôte). Chaque pas de service dessert d'abord le moteur HTTP, puis
//! chaque Function dans l'ordre d'enregistrement ; l'arrêt déroule l'ordre
//! inverse pour que les dépendants relâchent avant l'infrastructure.

use ionconfig::{Config, Store};
use ionhttp::{HttpEngine, SharedHttpEngine, shared};
use ionutils::{guess_local_ip, list_all_ips};
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::function::{
    Function, FunctionCore, FunctionState, ServiceContext, warn_if_not_running,
};
use crate::property::{
    FLAG_CONFIG, FLAG_DISABLED, FLAG_LOCK_LABEL, FLAG_READ_ONLY, FLAG_RESTART, FLAG_SYSTEM,
    Property, PropertyClass,
};

/// Longueurs maximales des identifiants réseau.
pub const MAX_SSID: usize = 31;
pub const MAX_PASS: usize = 63;
pub const MAX_HOST: usize = 62;

const MASTER_TAG: &str = "ion";

/// Erreurs du cycle de vie du registre.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("HTTP engine error: {0}")]
    Http(#[from] ionhttp::HttpError),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Paramètres de construction du Master.
pub struct MasterOptions {
    pub ssid: String,
    pub pass: String,
    pub port: u16,
    pub lock_wifi: bool,
    pub config_dir: String,
}

/// Function racine : registre, moteur HTTP partagé, identité du nœud.
pub struct Master {
    core: FunctionCore,
    functions: Vec<Box<dyn Function>>,
    http: SharedHttpEngine,
    store: Store,
    uuid: String,
    port: u16,
    ctx: Option<ServiceContext>,
    need_reboot: bool,
}

impl Master {
    pub fn new(opts: MasterOptions) -> Result<Self, CoreError> {
        let store = Store::open(&opts.config_dir)?;

        // Identité stable du nœud : générée une fois, persistée ensuite
        let uuid = match store.get(MASTER_TAG, "UUID") {
            Some(uuid) => uuid,
            None => {
                let uuid = Uuid::new_v4().to_string();
                info!("Generated node UUID: {}", uuid);
                store.set(MASTER_TAG, "UUID", &uuid);
                uuid
            }
        };

        let default_host = format!("ionode-{}", &uuid[..8]);

        let mut flags = FLAG_SYSTEM | FLAG_CONFIG | FLAG_LOCK_LABEL;
        if opts.lock_wifi {
            flags |= FLAG_READ_ONLY;
        }

        let core = FunctionCore::new(
            MASTER_TAG,
            vec![
                Property::text(flags, PropertyClass::Generic, &opts.ssid, MAX_SSID),
                Property::text(flags, PropertyClass::Generic, &opts.pass, MAX_PASS),
                Property::text(flags, PropertyClass::IpHost, &default_host, MAX_HOST),
            ],
        );

        Ok(Self {
            core,
            functions: Vec::new(),
            http: shared(HttpEngine::new(MASTER_TAG, opts.port)),
            store,
            uuid,
            port: opts.port,
            ctx: None,
            need_reboot: false,
        })
    }

    /// Construit le Master depuis la configuration YAML globale.
    pub fn from_config(config: &Config) -> Result<Self, CoreError> {
        let mut master = Self::new(MasterOptions {
            ssid: config.get_wifi_ssid(),
            pass: config.get_wifi_pass(),
            port: config.get_http_port(),
            lock_wifi: config.get_wifi_locked(),
            config_dir: config.get_config_dir().to_string(),
        })?;
        master.core.set_label(&config.get_friendly_name(), false, None);
        Ok(master)
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn label(&self) -> &str {
        self.core.label()
    }

    pub fn set_label(&mut self, label: &str, lock: bool) {
        self.core.set_label(label, lock, Some(&self.store));
    }

    /// Moteur HTTP partagé avec les Functions co-portées.
    pub fn server(&self) -> SharedHttpEngine {
        self.http.clone()
    }

    pub fn store(&self) -> Store {
        self.store.clone()
    }

    pub fn state(&self) -> FunctionState {
        self.core.state()
    }

    /// Enregistre une Function ; un tag déjà présent (celui du Master
    /// compris) est rejeté et la Function rendue à l'appelant.
    pub fn add_function(&mut self, function: Box<dyn Function>) -> Result<(), Box<dyn Function>> {
        let tag = function.core().tag().to_string();

        if tag == self.core.tag() || self.functions.iter().any(|f| f.core().tag() == tag) {
            error!("add_function({}) - duplicate tag", tag);
            return Err(function);
        }

        debug!("add_function({})", tag);
        self.functions.push(function);
        Ok(())
    }

    /// Nombre de Functions enregistrées.
    pub fn count(&self) -> usize {
        self.functions.len()
    }

    /// Recherche linéaire d'une Function par tag.
    fn position(&self, tag: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.core().tag() == tag)
    }

    /// Lecture rendue d'une propriété, par tag de Function.
    pub fn read_property(&self, tag: &str, index: usize) -> Option<String> {
        if tag == self.core.tag() {
            return Some(self.core.read_property(index));
        }
        self.position(tag)
            .map(|i| self.functions[i].core().read_property(index))
    }

    /// Point d'entrée d'écriture externe, routé vers la Function.
    pub fn write_property(&mut self, tag: &str, index: usize, raw: &str, urgent: bool) -> bool {
        if tag == self.core.tag() {
            // Le hook du Master accepte tout changement
            let changed = match self.core.apply_write(index, raw) {
                Some(changed) => changed,
                None => return false,
            };
            if changed {
                self.core.persist_property(index, &self.store);
            }
            return changed;
        }

        let Some(i) = self.position(tag) else {
            return false;
        };
        self.functions[i].write_property(index, raw, urgent, &self.store)
    }

    /// Démarre le nœud : persistance, moteur HTTP, puis chaque Function
    /// arrêtée et non désactivée, dans l'ordre d'enregistrement.
    pub fn startup(&mut self) -> Result<(), CoreError> {
        info!("Booting ...");

        self.core.load_persisted(&self.store);
        for f in &mut self.functions {
            f.core_mut().load_persisted(&self.store);
        }

        self.http.write().unwrap().startup()?;

        let local_ip = guess_local_ip();
        info!("Node UUID  : {}", self.uuid);
        info!("Hostname   : {}", self.core.read_property(2));
        info!("IP address : {}", local_ip);
        for (iface, ip) in list_all_ips() {
            debug!("Interface {}: {}", iface, ip);
        }

        let ctx = ServiceContext {
            store: self.store.clone(),
            http: self.http.clone(),
            http_port: self.port,
            local_ip,
        };

        self.core.set_state(FunctionState::Running);

        for f in &mut self.functions {
            if f.core().state() == FunctionState::Stopped && !f.core().has_flag(FLAG_DISABLED) {
                debug!(tag = %f.core().tag(), "Starting");
                f.start(&ctx);
                warn_if_not_running(f.core());
                f.core_mut().remove_flag(FLAG_RESTART);
            }
        }

        self.ctx = Some(ctx);
        let name = if self.core.label().is_empty() {
            self.core.tag()
        } else {
            self.core.label()
        };
        info!("✅ {} is running", name);
        Ok(())
    }

    /// Arrête le nœud : Functions en ordre inverse d'enregistrement, puis
    /// le moteur HTTP partagé.
    pub fn shutdown(&mut self) {
        if self.core.state() == FunctionState::Stopped {
            return;
        }

        if let Some(ctx) = self.ctx.clone() {
            for f in self.functions.iter_mut().rev() {
                if f.core().state() == FunctionState::Running {
                    f.stop(&ctx);
                    info!(tag = %f.core().tag(), "Stopped");
                }
                f.core_mut().set_state(FunctionState::Stopped);
            }
        }

        self.http.write().unwrap().shutdown();
        self.core.set_state(FunctionState::Stopped);
        info!("Stopped");
    }

    /// Un pas de service : moteur HTTP d'abord, puis chaque Function en
    /// ordre d'enregistrement. Une Function marquée RESTART est arrêtée et
    /// relancée sur place au lieu de son pas ordinaire.
    pub fn service(&mut self) {
        if self.core.state() != FunctionState::Running {
            return;
        }

        self.http.write().unwrap().service();

        let Some(ctx) = self.ctx.clone() else {
            return;
        };

        for f in &mut self.functions {
            if f.core().state() != FunctionState::Running || f.core().has_flag(FLAG_DISABLED) {
                continue;
            }

            if f.core().has_flag(FLAG_RESTART) {
                info!(tag = %f.core().tag(), "Restarting");
                f.stop(&ctx);
                f.core_mut().set_state(FunctionState::Stopped);
                f.start(&ctx);
                f.core_mut().remove_flag(FLAG_RESTART);
            } else {
                f.service(&ctx);
            }
        }
    }

    /// Arrêt puis redémarrage complet du nœud.
    pub fn restart(&mut self) -> Result<(), CoreError> {
        if self.core.state() != FunctionState::Stopped {
            self.shutdown();
        }
        self.startup()
    }

    /// Demande coopérative de redémarrage du processus hôte.
    pub fn request_reboot(&mut self) {
        self.need_reboot = true;
    }

    /// Consomme la demande de redémarrage.
    pub fn take_reboot_request(&mut self) -> bool {
        std::mem::take(&mut self.need_reboot)
    }

    /// Retour usine : efface l'état persisté de toutes les Functions et
    /// demande un redémarrage.
    pub fn factory_reset(&mut self) {
        info!("* System reset *");
        self.shutdown();

        self.store.remove_namespace(self.core.tag());
        let tags: Vec<String> = self
            .functions
            .iter()
            .map(|f| f.core().tag().to_string())
            .collect();
        for tag in tags {
            self.store.remove_namespace(&tag);
        }

        self.request_reboot();
    }
}
