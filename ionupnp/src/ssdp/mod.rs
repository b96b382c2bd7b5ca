//! # Module SSDP - Simple Service Discovery Protocol
//!
//! Ce module implémente le versant device du protocole SSDP pour UPnP :
//! l'écoute des M-SEARCH sur le groupe multicast, les réponses unicast
//! différées, et les annonces NOTIFY alive/byebye/update.
//!
//! ## Fonctionnalités
//!
//! - ✅ Tokeniseur M-SEARCH strict (`MAN: "ssdp:discover"` exigé)
//! - ✅ Réponses différées sur minuterie partagée, délai borné à 5 s
//! - ✅ Annonces multicast au démarrage, à l'arrêt et en keep-alive
//! - ✅ Registre de fiches en ajout seul, visibilité par device
//!
//! ## Constantes SSDP
//!
//! - **Groupe multicast** : 239.255.255.250:1900
//! - **Délai de réponse** : aléatoire dans `[0,5s, min(MX, 5s)]`

mod engine;
mod search;

pub use engine::{NotifyMethod, SsdpCore, SsdpEntry, SsdpHandle, shared_ssdp};
pub use search::{SearchRequest, parse_search};

use ioncore::{FLAG_LOCK_LABEL, FLAG_SYSTEM, Function, FunctionCore, FunctionState, ServiceContext};
use tracing::warn;

/// Adresse du groupe multicast SSDP.
pub const SSDP_MULTICAST_ADDR: &str = "239.255.255.250";

/// Port SSDP.
pub const SSDP_PORT: u16 = 1900;

/// TTL des datagrammes multicast.
pub const SSDP_MULTICAST_TTL: u32 = 2;

/// Borne basse du délai de réponse (ms).
pub const SSDP_RESPONSE_MIN_MS: u32 = 500;

/// Borne haute du délai de réponse (ms) : les contrôleurs pressés
/// n'attendent guère plus.
pub const SSDP_RESPONSE_CAP_MS: u32 = 5000;

/// Function de registre qui dessert le moteur SSDP partagé.
pub struct SsdpFunction {
    core: FunctionCore,
    shared: SsdpHandle,
}

impl SsdpFunction {
    pub fn new(shared: SsdpHandle) -> Self {
        let mut core = FunctionCore::new("ssdp", Vec::new());
        core.set_label("SSDP (UDP) responder service", true, None);
        core.insert_flag(FLAG_SYSTEM | FLAG_LOCK_LABEL);

        Self { core, shared }
    }

    /// Poignée du moteur, à distribuer aux devices.
    pub fn handle(&self) -> SsdpHandle {
        self.shared.clone()
    }
}

impl Function for SsdpFunction {
    fn core(&self) -> &FunctionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FunctionCore {
        &mut self.core
    }

    fn start(&mut self, _ctx: &ServiceContext) {
        match self.shared.write().unwrap().startup() {
            Ok(()) => self.core.set_state(FunctionState::Running),
            Err(e) => {
                warn!("❌ Failed to start SSDP engine: {}", e);
                self.core.set_state(FunctionState::Error);
            }
        }
    }

    fn stop(&mut self, _ctx: &ServiceContext) {
        self.shared.write().unwrap().shutdown();
        self.core.set_state(FunctionState::Stopped);
    }

    fn service(&mut self, _ctx: &ServiceContext) {
        self.shared.write().unwrap().service();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_exposes_shared_handle() {
        let function = SsdpFunction::new(shared_ssdp());
        let handle = function.handle();
        assert!(!handle.read().unwrap().running());
    }

    #[test]
    fn test_function_tag_and_label() {
        let function = SsdpFunction::new(shared_ssdp());
        assert_eq!(function.core().tag(), "ssdp");
        assert_eq!(function.core().label(), "SSDP (UDP) responder service");
    }
}
