//! Moteur SSDP : écoute multicast, réponses différées, annonces.
//!
//! Le moteur est partagé entre la Function de registre qui le dessert et
//! les devices qui s'y annoncent. Une seule minuterie de réponse est
//! partagée : chaque recherche valide la (ré)arme sur un délai aléatoire,
//! et son expiration vide les réponses en attente en unicast.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use ioncore::Timer;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace, warn};

use super::search::{SearchRequest, parse_search};
use super::{
    SSDP_MULTICAST_ADDR, SSDP_MULTICAST_TTL, SSDP_PORT, SSDP_RESPONSE_CAP_MS,
    SSDP_RESPONSE_MIN_MS,
};

/// Méthode d'une annonce NOTIFY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyMethod {
    Alive,
    ByeBye,
    Update,
}

impl NotifyMethod {
    fn nts(&self) -> &'static str {
        match self {
            Self::Alive => "alive",
            Self::ByeBye => "byebye",
            Self::Update => "update",
        }
    }
}

/// Fiche de découverte d'un device enregistré.
///
/// La liste des fiches est en ajout seul : le cycle de vie du device
/// bascule simplement `enabled`.
#[derive(Debug, Clone)]
pub struct SsdpEntry {
    pub uuid: String,
    pub device_type: String,
    pub search_type: Option<String>,
    pub location: String,
    pub server: String,
    pub max_age: u32,
    pub is_root: bool,
    pub extra_header: Option<String>,
    pub enabled: bool,
    pending: bool,
}

impl SsdpEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uuid: String,
        device_type: String,
        search_type: Option<String>,
        location: String,
        server: String,
        max_age: u32,
        is_root: bool,
        extra_header: Option<String>,
    ) -> Self {
        Self {
            uuid,
            device_type,
            search_type,
            location,
            server,
            max_age,
            is_root,
            extra_header,
            enabled: true,
            pending: false,
        }
    }

    /// Le device répond-il à cette cible de recherche ?
    fn matches(&self, st: &str) -> bool {
        if st.eq_ignore_ascii_case("upnp:rootdevice") {
            return self.is_root;
        }

        if st.eq_ignore_ascii_case(&self.device_type) {
            return true;
        }

        match &self.search_type {
            Some(search_type) => st.eq_ignore_ascii_case(search_type),
            None => false,
        }
    }

    /// ST renvoyé dans une réponse de recherche : le type de recherche
    /// prime quand il est déclaré.
    fn response_st(&self) -> &str {
        self.search_type.as_deref().unwrap_or(&self.device_type)
    }
}

/// Poignée de partage du moteur SSDP.
pub type SsdpHandle = Arc<RwLock<SsdpCore>>;

/// Crée un moteur SSDP enrobé dans sa poignée partageable.
pub fn shared_ssdp() -> SsdpHandle {
    Arc::new(RwLock::new(SsdpCore::new()))
}

/// Cœur du moteur SSDP.
pub struct SsdpCore {
    socket: Option<UdpSocket>,
    entries: Vec<SsdpEntry>,
    response_timer: Timer,
    pending_dest: Option<SocketAddr>,
    last_target: String,
}

impl SsdpCore {
    pub fn new() -> Self {
        Self {
            socket: None,
            entries: Vec::new(),
            response_timer: Timer::new(Duration::ZERO),
            pending_dest: None,
            last_target: String::new(),
        }
    }

    pub fn running(&self) -> bool {
        self.socket.is_some()
    }

    /// Ouvre la socket multicast du groupe UPnP.
    pub fn startup(&mut self) -> std::io::Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }

        let group: Ipv4Addr = SSDP_MULTICAST_ADDR.parse().unwrap();

        let socket2 = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket2.set_reuse_address(true)?;

        let bind_addr: SocketAddr = format!("0.0.0.0:{}", SSDP_PORT).parse().unwrap();
        socket2.bind(&bind_addr.into())?;

        let socket: UdpSocket = socket2.into();
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(false)?;
        socket.set_multicast_ttl_v4(SSDP_MULTICAST_TTL)?;
        socket.set_nonblocking(true)?;

        self.socket = Some(socket);
        self.response_timer.set_period(Duration::ZERO);

        info!("✅ SSDP engine listening on {}:{}", SSDP_MULTICAST_ADDR, SSDP_PORT);
        Ok(())
    }

    /// Ferme la socket ; les fiches restent en place.
    pub fn shutdown(&mut self) {
        if self.socket.take().is_some() {
            info!("SSDP engine stopped");
        }
        self.response_timer.set_period(Duration::ZERO);
        self.pending_dest = None;
    }

    /// Enregistre ou met à jour la fiche d'un device (clé : UUID).
    pub fn register(&mut self, entry: SsdpEntry) {
        match self.entries.iter_mut().find(|e| e.uuid == entry.uuid) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Bascule la visibilité d'une fiche.
    pub fn set_enabled(&mut self, uuid: &str, enabled: bool) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.uuid == uuid) {
            entry.enabled = enabled;
            if !enabled {
                entry.pending = false;
            }
        }
    }

    pub fn entries(&self) -> &[SsdpEntry] {
        &self.entries
    }

    /// Nombre de réponses en attente d'expédition.
    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.pending).count()
    }

    /// Un pas de service : un datagramme au plus, puis les réponses mûres.
    pub fn service(&mut self) {
        if self.socket.is_none() {
            return;
        }

        // Pas de nouvelle recherche tant qu'une réponse est programmée
        if self.response_timer.period().is_zero() {
            let mut buf = [0u8; 1024];
            let received = match self.socket.as_ref().unwrap().recv_from(&mut buf) {
                Ok((len, from)) => Some((len, from)),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
                Err(e) => {
                    warn!("❌ SSDP read error: {}", e);
                    None
                }
            };

            if let Some((len, from)) = received {
                match parse_search(&buf[..len]) {
                    Some(request) => self.handle_search(&request, from),
                    None => {
                        // Datagramme hors protocole : silence
                        trace!("SSDP datagram ignored ({} bytes)", len);
                    }
                }
            }
        }

        if !self.response_timer.period().is_zero() && self.response_timer.expired() {
            self.dispatch_pending();
            self.response_timer.set_period(Duration::ZERO);
        }
    }

    /// Marque en attente chaque device visé et (ré)arme la minuterie
    /// partagée sur un délai aléatoire dans `[500ms, min(MX, 5s)]`.
    pub fn handle_search(&mut self, request: &SearchRequest, from: SocketAddr) {
        let all = request.search_target == "ssdp:all";
        let mut matched = false;

        for entry in self.entries.iter_mut() {
            if !entry.enabled {
                continue;
            }

            if all || entry.matches(&request.search_target) {
                entry.pending = true;
                matched = true;
            }
        }

        if !matched {
            return;
        }

        let cap = (request.max_wait.saturating_mul(1000)).clamp(SSDP_RESPONSE_MIN_MS, SSDP_RESPONSE_CAP_MS);
        let delay = rand::rng().random_range(SSDP_RESPONSE_MIN_MS..=cap);

        trace!(
            "Search [{}] from {} - delay {}ms",
            request.search_target, from, delay
        );

        self.pending_dest = Some(from);
        self.last_target = request.search_target.clone();
        self.response_timer.set_period(Duration::from_millis(delay as u64));
        self.response_timer.reset();
    }

    /// Expédie les réponses unicast des fiches en attente.
    pub fn dispatch_pending(&mut self) {
        let Some(dest) = self.pending_dest.take() else {
            return;
        };

        for i in 0..self.entries.len() {
            if !self.entries[i].enabled || !self.entries[i].pending {
                continue;
            }

            let packet = build_response(&self.entries[i]);
            self.send_to(&packet, dest);
            self.entries[i].pending = false;

            debug!(
                "📡 Response: {} - [{}] {}",
                dest, self.last_target, self.entries[i].device_type
            );
        }
    }

    /// Annonce multicast ponctuelle pour un device (alive/byebye/update).
    pub fn notify(&mut self, uuid: &str, method: NotifyMethod) {
        if self.socket.is_none() {
            return;
        }

        let Some(entry) = self.entries.iter().find(|e| e.uuid == uuid) else {
            return;
        };

        let packet = build_notify(entry, method);
        let dest: SocketAddr = format!("{}:{}", SSDP_MULTICAST_ADDR, SSDP_PORT)
            .parse()
            .unwrap();

        let marker = if method == NotifyMethod::ByeBye {
            "👋"
        } else {
            "📡"
        };
        debug!("{} NOTIFY ({}): {}", marker, method.nts(), entry.device_type);

        self.send_to(&packet, dest);
    }

    fn send_to(&self, packet: &str, dest: SocketAddr) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };

        if let Err(e) = socket.send_to(packet.as_bytes(), dest) {
            warn!("❌ SSDP packet not sent to {}: {}", dest, e);
        }
    }
}

impl Default for SsdpCore {
    fn default() -> Self {
        Self::new()
    }
}

/// Réponse unicast à une recherche.
fn build_response(entry: &SsdpEntry) -> String {
    let date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
    let extra = entry
        .extra_header
        .as_deref()
        .map(|h| format!("{}\r\n", h))
        .unwrap_or_default();

    format!(
        "HTTP/1.1 200 OK\r\n\
         EXT:\r\n\
         CACHE-CONTROL: max-age={}\r\n\
         DATE: {}\r\n\
         SERVER: {}\r\n\
         USN: uuid:{}::{}\r\n\
         ST: {}\r\n\
         LOCATION: {}\r\n\
         {}\r\n",
        entry.max_age,
        date,
        entry.server,
        entry.uuid,
        entry.device_type,
        entry.response_st(),
        entry.location,
        extra
    )
}

/// Annonce multicast NOTIFY.
fn build_notify(entry: &SsdpEntry, method: NotifyMethod) -> String {
    let extra = entry
        .extra_header
        .as_deref()
        .map(|h| format!("{}\r\n", h))
        .unwrap_or_default();

    format!(
        "NOTIFY * HTTP/1.1\r\n\
         HOST: {}:{}\r\n\
         NTS: ssdp:{}\r\n\
         CACHE-CONTROL: max-age={}\r\n\
         SERVER: {}\r\n\
         USN: uuid:{}::{}\r\n\
         NT: {}\r\n\
         LOCATION: {}\r\n\
         {}\r\n",
        SSDP_MULTICAST_ADDR,
        SSDP_PORT,
        method.nts(),
        entry.max_age,
        entry.server,
        entry.uuid,
        entry.device_type,
        entry.device_type,
        entry.location,
        extra
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(uuid: &str, device_type: &str, root: bool) -> SsdpEntry {
        SsdpEntry::new(
            uuid.to_string(),
            device_type.to_string(),
            None,
            "http://192.168.1.10:8080/schema.xml".to_string(),
            "Linux/6.5 UPnP/1.1 IONode/0.1.0".to_string(),
            1200,
            root,
            None,
        )
    }

    fn search(st: &str, mx: u32) -> SearchRequest {
        SearchRequest {
            search_target: st.to_string(),
            max_wait: mx,
        }
    }

    fn from_addr() -> SocketAddr {
        "192.168.1.50:50000".parse().unwrap()
    }

    #[test]
    fn test_ssdp_all_schedules_every_running_device() {
        let mut core = SsdpCore::new();
        core.register(entry("u1", "urn:x:device:A:1", false));
        core.register(entry("u2", "urn:x:device:B:1", false));
        core.register(entry("u3", "urn:x:device:C:1", true));

        core.handle_search(&search("ssdp:all", 3), from_addr());

        assert_eq!(core.pending_count(), 3);
        let period = core.response_timer.period();
        assert!(period >= Duration::from_millis(500));
        assert!(period <= Duration::from_millis(3000));
    }

    #[test]
    fn test_no_match_schedules_nothing() {
        let mut core = SsdpCore::new();
        core.register(entry("u1", "urn:x:device:A:1", false));

        core.handle_search(&search("urn:x:device:Missing:1", 3), from_addr());

        assert_eq!(core.pending_count(), 0);
        assert!(core.response_timer.period().is_zero());
    }

    #[test]
    fn test_disabled_entry_never_matches() {
        let mut core = SsdpCore::new();
        core.register(entry("u1", "urn:x:device:A:1", false));
        core.set_enabled("u1", false);

        core.handle_search(&search("ssdp:all", 2), from_addr());
        assert_eq!(core.pending_count(), 0);
    }

    #[test]
    fn test_rootdevice_matches_only_roots() {
        let mut core = SsdpCore::new();
        core.register(entry("u1", "urn:x:device:A:1", false));
        core.register(entry("u2", "urn:x:device:B:1", true));

        core.handle_search(&search("upnp:rootdevice", 2), from_addr());
        assert_eq!(core.pending_count(), 1);
        assert!(core.entries()[1].pending);
    }

    #[test]
    fn test_device_type_match_case_insensitive() {
        let mut core = SsdpCore::new();
        core.register(entry("u1", "urn:x:device:A:1", false));

        core.handle_search(&search("URN:X:DEVICE:A:1", 2), from_addr());
        assert_eq!(core.pending_count(), 1);
    }

    #[test]
    fn test_search_type_matches_and_prefers_in_response() {
        let mut core = SsdpCore::new();
        let mut e = entry("u1", "urn:x:device:A:1", false);
        e.search_type = Some("urn:x:device:**".to_string());
        core.register(e);

        core.handle_search(&search("urn:x:device:**", 2), from_addr());
        assert_eq!(core.pending_count(), 1);

        let packet = build_response(&core.entries()[0]);
        assert!(packet.contains("ST: urn:x:device:**\r\n"));
        assert!(packet.contains("USN: uuid:u1::urn:x:device:A:1\r\n"));
    }

    #[test]
    fn test_delay_capped_at_five_seconds() {
        let mut core = SsdpCore::new();
        core.register(entry("u1", "urn:x:device:A:1", false));

        core.handle_search(&search("ssdp:all", 120), from_addr());

        assert!(core.response_timer.period() <= Duration::from_millis(5000));
        assert!(core.response_timer.period() >= Duration::from_millis(500));
    }

    #[test]
    fn test_response_packet_shape() {
        let packet = build_response(&entry("abc", "urn:x:device:A:1", true));
        assert!(packet.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(packet.contains("EXT:\r\n"));
        assert!(packet.contains("CACHE-CONTROL: max-age=1200\r\n"));
        assert!(packet.contains("LOCATION: http://192.168.1.10:8080/schema.xml\r\n"));
        assert!(packet.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_notify_packet_shape() {
        let packet = build_notify(&entry("abc", "urn:x:device:A:1", true), NotifyMethod::ByeBye);
        assert!(packet.starts_with("NOTIFY * HTTP/1.1\r\n"));
        assert!(packet.contains("HOST: 239.255.255.250:1900\r\n"));
        assert!(packet.contains("NTS: ssdp:byebye\r\n"));
        assert!(packet.contains("NT: urn:x:device:A:1\r\n"));
        assert!(!packet.contains("\r\nST:"));
    }

    #[test]
    fn test_register_updates_existing_uuid() {
        let mut core = SsdpCore::new();
        core.register(entry("u1", "urn:x:device:A:1", false));
        core.register(entry("u1", "urn:x:device:A:2", false));

        assert_eq!(core.entries().len(), 1);
        assert_eq!(core.entries()[0].device_type, "urn:x:device:A:2");
    }

    #[test]
    fn test_extra_header_included() {
        let mut e = entry("u1", "urn:x:device:A:1", false);
        e.extra_header = Some("OPT: \"http://schemas.upnp.org/upnp/1/0/\"; ns=01".to_string());
        let packet = build_response(&e);
        assert!(packet.contains("OPT: \"http://schemas.upnp.org/upnp/1/0/\"; ns=01\r\n"));
    }
}
