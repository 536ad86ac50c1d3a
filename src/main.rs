use std::process::ExitCode;
use std::sync::mpsc;

use screentopo::{Config, Edid, backend_from_env};

fn panel_label(edid: &Edid) -> String {
    format!(
        "{} {}",
        edid.pnp_id.as_deref().unwrap_or("-"),
        edid.name.as_deref().unwrap_or("-")
    )
}

fn print_config(config: &Config) {
    let screen = &config.screen;
    println!(
        "screen: {}x{} (outputs hash {})",
        screen.current_size.width,
        screen.current_size.height,
        config.connected_outputs_hash()
    );
    for output in config.outputs() {
        let mode = output.current_mode_id.as_deref().unwrap_or("-");
        let state = if output.enabled { "enabled" } else { "disabled" };
        let primary = if output.is_primary() { " primary" } else { "" };
        println!(
            "  {} [{:?}] {state}{primary} priority={} mode={mode} at {},{} scale={}",
            output.name, output.output_type, output.priority, output.pos.x, output.pos.y,
            output.scale
        );
        if let Some(edid) = Edid::parse(&output.edid) {
            println!("    panel: {}", panel_label(&edid));
        }
        for mode in output.sorted_modes() {
            let preferred = if output.preferred_mode_ids.iter().any(|id| id == mode.id()) {
                " (preferred)"
            } else {
                ""
            };
            println!("    {}{preferred}", mode.name());
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let watch = std::env::args().any(|arg| arg == "--watch");

    let (emitter, events) = mpsc::sync_channel(16);
    let backend = match backend_from_env(emitter) {
        Ok(backend) => backend,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    match backend.config() {
        Ok(config) => print_config(&config),
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    }

    if watch {
        use screentopo::BackendEvent;
        for event in events {
            match event {
                BackendEvent::ConfigChanged(config) => {
                    println!("--- topology changed ---");
                    print_config(&config);
                }
                BackendEvent::ConnectionLost(reason) => {
                    eprintln!("error: connection lost: {reason}");
                    return ExitCode::FAILURE;
                }
            }
        }
    }
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panel_label_handles_missing_fields() {
        let edid = Edid {
            pnp_id: Some("DEL".into()),
            name: None,
            serial: None,
        };
        assert_eq!(panel_label(&edid), "DEL -");
        assert_eq!(panel_label(&Edid::default()), "- -");
    }
}
