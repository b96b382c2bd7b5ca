//! Device UPnP : une Function qui s'annonce en SSDP et sert sa
//! description par HTTP.
//!
//! Le device porte ses métadonnées de description comme des propriétés
//! ordinaires (UUID en tête, puis chemin du schéma, série, modèle,
//! fabricant, URL de présentation). Tout changement de propriété pose le
//! drapeau RESTART : il n'y a pas de reconfiguration incrémentale, le
//! registre l'arrête et le relance au pas suivant.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use ioncore::{
    FLAG_CONFIG, FLAG_READ_ONLY, FLAG_RESTART, FLAG_SYSTEM, Function, FunctionCore, FunctionState,
    Property, PropertyClass, ServiceContext, Timer,
};
use ionhttp::{
    HttpEngine, HttpHandler, HttpMethod, MIME_TYPE_XML, SharedHttpEngine, Transaction, shared,
};
use ionutils::get_os_string;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ssdp::{NotifyMethod, SsdpEntry, SsdpHandle};

/// Chemin par défaut du document de description.
pub const UPNP_SCHEMA_URL: &str = "/schema.xml";

/// Chemin par défaut de la page de présentation.
pub const UPNP_PRESENTATION_URL: &str = "/index.html";

/// Période par défaut du keep-alive SSDP (secondes).
pub const SSDP_NOTIFY_INTERVAL: u32 = 1200;

/// Port HTTP par défaut d'un device.
pub const UPNP_DEFAULT_PORT: u16 = 9980;

const PROJECT_URL: &str = "https://github.com/ionode/IONode";

// Indices stables des propriétés de description
pub const PROP_UUID: usize = 0;
pub const PROP_SCHEMA_URL: usize = 1;
pub const PROP_SERIAL: usize = 2;
pub const PROP_MODEL_NAME: usize = 3;
pub const PROP_MODEL_NUMBER: usize = 4;
pub const PROP_MODEL_URL: usize = 5;
pub const PROP_MANUFACTURER: usize = 6;
pub const PROP_MANUFACTURER_URL: usize = 7;
pub const PROP_PRESENTATION_URL: usize = 8;

/// Vue figée de la description, partagée avec le handler HTTP.
///
/// Reconstruite à chaque démarrage du device : toute mutation de
/// propriété passe par un redémarrage, la vue ne peut donc pas dériver.
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    pub friendly_name: String,
    pub device_type: String,
    pub uuid: String,
    pub schema_url: String,
    pub serial: String,
    pub model_name: String,
    pub model_number: String,
    pub model_url: String,
    pub manufacturer: String,
    pub manufacturer_url: String,
    pub presentation_url: String,
    pub local_ip: String,
    pub port: u16,
    pub master_port: u16,
}

/// Function device UPnP.
pub struct UpnpDevice {
    core: FunctionCore,
    device_type: String,
    search_type: Option<String>,
    is_root: bool,
    port: u16,
    interval: u32,
    keepalive: Timer,
    ssdp: SsdpHandle,
    http: Option<SharedHttpEngine>,
    owns_http: bool,
    extra_header: Option<String>,
    snapshot: Arc<RwLock<DeviceSnapshot>>,
}

impl UpnpDevice {
    pub fn new(device_type: &str, port: u16, ssdp: SsdpHandle) -> Self {
        let flags = FLAG_SYSTEM | FLAG_CONFIG;
        let uuid_flags = flags | FLAG_READ_ONLY;

        let model_number = env!("CARGO_PKG_VERSION");

        let core = FunctionCore::new(
            &format!("ssdp-{}", port),
            vec![
                Property::text(uuid_flags, PropertyClass::Generic, "", 64),
                Property::text(flags, PropertyClass::Generic, UPNP_SCHEMA_URL, 64),
                Property::text(flags, PropertyClass::Generic, "", 32),
                Property::text(flags, PropertyClass::Generic, "IONode", 64),
                Property::text(flags, PropertyClass::Generic, model_number, 32),
                Property::text(flags, PropertyClass::Generic, PROJECT_URL, 128),
                Property::text(flags, PropertyClass::Generic, "IONode", 64),
                Property::text(flags, PropertyClass::Generic, PROJECT_URL, 128),
                Property::text(flags, PropertyClass::Generic, UPNP_PRESENTATION_URL, 128),
            ],
        );

        Self {
            core,
            device_type: device_type.to_string(),
            search_type: None,
            is_root: false,
            port,
            interval: SSDP_NOTIFY_INTERVAL,
            keepalive: Timer::new(Duration::from_secs(SSDP_NOTIFY_INTERVAL as u64)),
            ssdp,
            http: None,
            owns_http: false,
            extra_header: None,
            snapshot: Arc::new(RwLock::new(DeviceSnapshot::default())),
        }
    }

    /// Cible de recherche supplémentaire (ex: `urn:x:device:**`).
    pub fn with_search_type(mut self, search_type: &str) -> Self {
        self.search_type = Some(search_type.to_string());
        self
    }

    /// Déclare le device racine : il répond à `upnp:rootdevice`.
    pub fn as_root(mut self) -> Self {
        self.is_root = true;
        self
    }

    /// Période du keep-alive SSDP, en secondes.
    pub fn with_interval(mut self, seconds: u32) -> Self {
        self.interval = seconds;
        self.keepalive = Timer::new(Duration::from_secs(seconds as u64));
        self
    }

    /// En-tête supplémentaire ajouté aux paquets SSDP du device.
    pub fn with_extra_header(mut self, header: &str) -> Self {
        self.extra_header = Some(header.to_string());
        self
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn uuid(&self) -> String {
        self.core.read_property(PROP_UUID)
    }

    /// Vue de description partagée avec le handler.
    pub fn snapshot(&self) -> Arc<RwLock<DeviceSnapshot>> {
        self.snapshot.clone()
    }

    /// Annonce ponctuelle, hors keep-alive.
    pub fn notify(&mut self, method: NotifyMethod) {
        self.ssdp.write().unwrap().notify(&self.uuid(), method);
        self.keepalive.reset();
    }

    fn ensure_uuid(&mut self, ctx: &ServiceContext) {
        if !self.core.read_property(PROP_UUID).is_empty() {
            return;
        }

        let uuid = Uuid::new_v4().to_string();
        info!(tag = %self.core.tag(), "Generated UUID - {}", uuid);

        self.core.initialize_property(PROP_UUID, &uuid);
        self.core.persist_property(PROP_UUID, &ctx.store);

        // La série par défaut suit l'identité générée
        if self.core.read_property(PROP_SERIAL).is_empty() {
            self.core.initialize_property(PROP_SERIAL, &uuid);
            self.core.persist_property(PROP_SERIAL, &ctx.store);
        }
    }

    fn build_snapshot(&self, ctx: &ServiceContext) -> DeviceSnapshot {
        let friendly_name = if self.core.label().is_empty() {
            self.core.tag().to_string()
        } else {
            self.core.label().to_string()
        };

        DeviceSnapshot {
            friendly_name,
            device_type: self.device_type.clone(),
            uuid: self.core.read_property(PROP_UUID),
            schema_url: self.core.read_property(PROP_SCHEMA_URL),
            serial: self.core.read_property(PROP_SERIAL),
            model_name: self.core.read_property(PROP_MODEL_NAME),
            model_number: self.core.read_property(PROP_MODEL_NUMBER),
            model_url: self.core.read_property(PROP_MODEL_URL),
            manufacturer: self.core.read_property(PROP_MANUFACTURER),
            manufacturer_url: self.core.read_property(PROP_MANUFACTURER_URL),
            presentation_url: self.core.read_property(PROP_PRESENTATION_URL),
            local_ip: ctx.local_ip.clone(),
            port: self.port,
            master_port: ctx.http_port,
        }
    }

    fn ssdp_entry(&self, snapshot: &DeviceSnapshot) -> SsdpEntry {
        SsdpEntry::new(
            snapshot.uuid.clone(),
            self.device_type.clone(),
            self.search_type.clone(),
            format!(
                "http://{}:{}{}",
                snapshot.local_ip, self.port, snapshot.schema_url
            ),
            format!(
                "{} UPnP/1.1 {}/{}",
                get_os_string(),
                snapshot.model_name,
                snapshot.model_number
            ),
            self.interval,
            self.is_root,
            self.extra_header.clone(),
        )
    }
}

impl Function for UpnpDevice {
    fn core(&self) -> &FunctionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FunctionCore {
        &mut self.core
    }

    fn start(&mut self, ctx: &ServiceContext) {
        if self.core.state() != FunctionState::Stopped {
            return;
        }

        self.ensure_uuid(ctx);

        // Adopte le moteur du Master sur port commun, sinon moteur privé
        if self.http.is_none() {
            if ctx.http_port == self.port {
                self.http = Some(ctx.http.clone());
                self.owns_http = false;
            } else {
                let mut engine = HttpEngine::new(self.core.tag(), self.port);
                if let Err(e) = engine.startup() {
                    warn!(tag = %self.core.tag(), "❌ Failed to start device HTTP engine: {}", e);
                    self.core.set_state(FunctionState::Error);
                    return;
                }
                self.http = Some(shared(engine));
                self.owns_http = true;
            }

            let snapshot = self.build_snapshot(ctx);
            *self.snapshot.write().unwrap() = snapshot.clone();

            {
                let http = self.http.as_ref().unwrap();
                let mut http = http.write().unwrap();
                http.collect_headers(&["SOAPACTION", "SID"]);
                http.add_handler(Box::new(DeviceHandler {
                    owner: self.core.tag().to_string(),
                    snapshot: self.snapshot.clone(),
                }));
            }

            let mut ssdp = self.ssdp.write().unwrap();
            ssdp.register(self.ssdp_entry(&snapshot));
            ssdp.set_enabled(&snapshot.uuid, true);
            ssdp.notify(&snapshot.uuid, NotifyMethod::Alive);
        }

        self.keepalive.reset();
        self.core.set_state(FunctionState::Running);
    }

    fn stop(&mut self, _ctx: &ServiceContext) {
        if self.core.state() == FunctionState::Running {
            let uuid = self.uuid();
            {
                let mut ssdp = self.ssdp.write().unwrap();
                ssdp.notify(&uuid, NotifyMethod::ByeBye);
                ssdp.set_enabled(&uuid, false);
            }

            // Le moteur privé n'est jamais réutilisé : il sera recréé au
            // prochain démarrage, port éventuellement différent
            if let Some(http) = self.http.take() {
                let mut http = http.write().unwrap();
                if self.owns_http {
                    http.shutdown();
                } else {
                    http.remove_handlers_by_owner(self.core.tag());
                }
            }
            self.owns_http = false;
        }

        self.core.set_state(FunctionState::Stopped);
    }

    fn service(&mut self, _ctx: &ServiceContext) {
        if self.core.state() != FunctionState::Running {
            return;
        }

        if self.owns_http {
            if let Some(http) = self.http.as_ref() {
                http.write().unwrap().service();
            }
        }

        // Keep-alive SSDP
        if self.keepalive.expired() {
            let uuid = self.uuid();
            self.ssdp.write().unwrap().notify(&uuid, NotifyMethod::Alive);
            self.keepalive.reset();
        }
    }

    fn on_property_update(&mut self, _index: usize, _urgent: bool) -> bool {
        // Tout changement de description exige un arrêt/relance
        self.core.insert_flag(FLAG_RESTART);
        true
    }
}

/// Route HTTP du device : description, présentation, actions SOAP.
struct DeviceHandler {
    owner: String,
    snapshot: Arc<RwLock<DeviceSnapshot>>,
}

impl HttpHandler for DeviceHandler {
    fn owner(&self) -> Option<&str> {
        Some(&self.owner)
    }

    fn can_handle(&self, method: HttpMethod, uri: &str) -> bool {
        let snap = self.snapshot.read().unwrap();

        if uri == "/" || uri == snap.presentation_url {
            return true;
        }
        if method == HttpMethod::Get && uri == snap.schema_url {
            return true;
        }
        uri.starts_with("/upnp/")
    }

    fn handle(&mut self, tx: &mut Transaction<'_>, method: HttpMethod, uri: &str) -> bool {
        let snap = self.snapshot.read().unwrap().clone();

        // Page de présentation : redirigée vers le port du Master
        if uri == "/" || uri == snap.presentation_url {
            if snap.master_port != snap.port {
                let location = format!(
                    "http://{}:{}{}",
                    snap.local_ip, snap.master_port, snap.presentation_url
                );
                tx.send_header("Location", &location, false);
                // UPnP 1.1 : 307, pas 301
                return tx.send(307, None, "").is_ok();
            }
            return tx.send(503, None, "").is_ok();
        }

        if method == HttpMethod::Get && uri == snap.schema_url {
            return tx.send(200, Some(MIME_TYPE_XML), &render_schema(&snap)).is_ok();
        }

        // Action SOAP : `"urn:service#action"` dans l'en-tête SOAPACTION
        if let Some(action) = tx.header("SOAPACTION") {
            let action = action.trim();
            if action.is_empty() {
                return tx.send(500, None, "").is_ok();
            }

            let trimmed = action.trim_matches('"');
            let (urn, act) = match trimmed.find('#') {
                Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
                None => (trimmed, ""),
            };

            debug!(owner = %self.owner, "SOAPAction: URN={} ACT={}", urn, act);

            // Le device de base n'expose aucune action
            return tx.send(501, None, "").is_ok();
        }

        false
    }
}

/// Rend le document de description UPnP du device.
fn render_schema(snap: &DeviceSnapshot) -> String {
    format!(
        "<?xml version=\"1.0\"?>\
         <root xmlns=\"urn:schemas-upnp-org:device-1-0\">\
         <URLBase>http://{}:{}/</URLBase>\
         <device>\
         <friendlyName>{}</friendlyName>\
         <deviceType>{}</deviceType>\
         <manufacturer>{}</manufacturer>\
         <manufacturerURL>{}</manufacturerURL>\
         <modelName>{}</modelName>\
         <modelNumber>{}</modelNumber>\
         <modelURL>{}</modelURL>\
         <serialNumber>{}</serialNumber>\
         <UDN>uuid:{}</UDN>\
         <serviceList></serviceList>\
         <deviceList></deviceList>\
         <presentationURL>{}</presentationURL>\
         </device>\
         <specVersion><major>1</major><minor>0</minor></specVersion>\
         </root>\r\n",
        snap.local_ip,
        snap.port,
        snap.friendly_name,
        snap.device_type,
        snap.manufacturer,
        snap.manufacturer_url,
        snap.model_name,
        snap.model_number,
        snap.model_url,
        snap.serial,
        snap.uuid,
        snap.presentation_url
    )
}
