use std::thread;
use std::time::Duration;

use ionconfig::get_config;
use ioncore::{Function, Master};
use ionhttp::{HttpMethod, MIME_TYPE_HTML};
use ionupnp::{SsdpFunction, UpnpDevice, shared_ssdp};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = get_config();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.get_log_min_level().to_lowercase())),
        )
        .init();

    // ========== PHASE 1 : Modèle d'entités ==========

    let mut master = Master::from_config(&config)?;
    let port = master.port();

    // ========== PHASE 2 : Découverte et description ==========

    info!("📡 Registering SSDP responder and root device...");

    let ssdp = shared_ssdp();
    let responder = SsdpFunction::new(ssdp.clone());

    let mut device = UpnpDevice::new("urn:schemas-upnp-org:device:Basic:1", port, ssdp).as_root();
    device
        .core_mut()
        .set_label(&config.get_friendly_name(), false, None);

    master
        .add_function(Box::new(responder))
        .map_err(|_| "duplicate ssdp responder tag")?;
    master
        .add_function(Box::new(device))
        .map_err(|_| "duplicate device tag")?;

    // Page de présentation servie par le moteur partagé
    let name = config.get_friendly_name();
    let page = format!(
        "<html><head><title>{0}</title></head>\
         <body><h1>{0}</h1><p>IONode {1}</p></body></html>",
        name,
        env!("CARGO_PKG_VERSION")
    );
    master.server().write().unwrap().on_method(
        "/index.html",
        HttpMethod::Get,
        Box::new(move |tx| {
            let _ = tx.send(200, Some(MIME_TYPE_HTML), &page);
        }),
    );

    // ========== PHASE 3 : Boucle de service ==========

    info!("🌐 Starting runtime on port {}...", port);
    master.startup()?;
    info!("✅ IONode is ready!");

    loop {
        master.service();

        if master.take_reboot_request() {
            info!("Reboot requested, shutting down");
            break;
        }

        thread::sleep(Duration::from_millis(2));
    }

    master.shutdown();
    Ok(())
}
