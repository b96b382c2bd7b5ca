//! # Module UPnP - Découverte et description des devices
//!
//! Ce module relie le modèle d'entités aux deux protocoles filaires du
//! runtime : le moteur SSDP (découverte multicast) et le moteur HTTP
//! (document de description, actions). Un [`UpnpDevice`] est une Function
//! ordinaire qui s'enregistre auprès des deux au démarrage, s'annonce
//! `alive`, entretient un keep-alive périodique, et prend congé d'un
//! `byebye` à l'arrêt.

pub mod device;
pub mod ssdp;

pub use device::{
    DeviceSnapshot, PROP_MANUFACTURER, PROP_MANUFACTURER_URL, PROP_MODEL_NAME, PROP_MODEL_NUMBER,
    PROP_MODEL_URL, PROP_PRESENTATION_URL, PROP_SCHEMA_URL, PROP_SERIAL, PROP_UUID,
    SSDP_NOTIFY_INTERVAL, UPNP_DEFAULT_PORT, UPNP_PRESENTATION_URL, UPNP_SCHEMA_URL, UpnpDevice,
};
pub use ssdp::{
    NotifyMethod, SSDP_MULTICAST_ADDR, SSDP_PORT, SearchRequest, SsdpCore, SsdpEntry,
    SsdpFunction, SsdpHandle, parse_search, shared_ssdp,
};
