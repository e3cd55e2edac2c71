use probelink_lib::SerialLink;
use tracing::info;

fn main() {
    tracing_subscriber::fmt::init();

    info!("Listing serial ports...\n");

    match SerialLink::list_ports() {
        Ok(ports) => {
            for (i, port) in ports.iter().enumerate() {
                info!("Port #{}: {}", i + 1, port.port_name);
                info!("  Type: {:?}", port.port_type);
                info!("---");
            }
            if ports.is_empty() {
                info!("No serial ports found.");
            }
        }
        Err(e) => {
            eprintln!("Error listing serial ports: {:?}", e);
        }
    }
}
