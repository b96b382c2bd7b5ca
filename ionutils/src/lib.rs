//! Utilitaires réseau et système partagés par le runtime IONode.

mod net;

pub use net::{guess_local_ip, list_all_ips};

/// Retourne une chaîne décrivant le système d'exploitation et sa version.
///
/// Le résultat alimente la bannière `SERVER` des paquets SSDP, au format
/// attendu par les contrôleurs UPnP (ex: `"Linux/6.5.0"`).
pub fn get_os_string() -> String {
    let info = os_info::get();
    let os_type = format!("{:?}", info.os_type());

    let version = info.version();
    if version != &os_info::Version::Unknown {
        format!("{}/{}", os_type, version)
    } else {
        format!("{}/Unknown", os_type)
    }
}
