//! Détection des adresses IP locales.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use get_if_addrs::get_if_addrs;

/// Devine l'adresse IP locale utilisée pour les connexions sortantes.
///
/// Un socket UDP est "connecté" vers un serveur DNS public, ce qui demande
/// simplement au système quelle interface servirait pour joindre cette
/// adresse. Aucun datagramme n'est émis. En cas d'échec, retourne
/// `127.0.0.1`.
pub fn guess_local_ip() -> String {
    match UdpSocket::bind("0.0.0.0:0") {
        Ok(socket) => {
            if socket.connect("8.8.8.8:80").is_ok() {
                if let Ok(local_addr) = socket.local_addr() {
                    return local_addr.ip().to_string();
                }
            }
            "127.0.0.1".to_string()
        }
        Err(_) => "127.0.0.1".to_string(),
    }
}

/// Liste les adresses IPv4 non-loopback de chaque interface réseau.
///
/// Retourne des paires `(nom d'interface, adresse)` dans l'ordre rapporté
/// par le système. Les adresses IPv6 et loopback sont ignorées.
pub fn list_all_ips() -> Vec<(String, Ipv4Addr)> {
    let mut result = Vec::new();

    if let Ok(interfaces) = get_if_addrs() {
        for iface in interfaces {
            match iface.ip() {
                IpAddr::V4(ip) if !ip.is_loopback() => {
                    result.push((iface.name, ip));
                }
                _ => {}
            }
        }
    }

    result
}
