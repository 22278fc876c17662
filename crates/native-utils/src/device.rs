use anyhow::Context;
use cpal::Device;
use cpal::traits::{DeviceTrait, HostTrait};

fn get_host() -> cpal::Host {
    cpal::default_host()
}

/// Finds the named output device, or the host's default one.
pub fn get_or_default_output(device_name: Option<String>) -> anyhow::Result<Device> {
    let host = get_host();
    tracing::debug!("Host: {:?}", host.id());

    let target = match device_name {
        Some(name) => name,
        None => host
            .default_output_device()
            .context("No default output device")?
            .name()?,
    };

    host.output_devices()?
        .find(|device| device.name().is_ok_and(|name| name == target))
        .ok_or_else(|| anyhow::anyhow!("No target device found: {}", target))
}

/// One line per output device with its default format.
pub fn get_available_outputs() -> anyhow::Result<String> {
    for host in cpal::available_hosts() {
        tracing::debug!("Available host: {:?}", host);
    }

    let host = get_host();
    let default_device = host
        .default_output_device()
        .and_then(|device| device.name().ok())
        .unwrap_or_default();

    let mut device_names: Vec<String> = Vec::new();
    for out_device in host.output_devices()? {
        let Ok(d_name) = out_device.name() else {
            continue;
        };
        let mut d = match out_device.default_output_config() {
            Ok(d_cfg) => format!(
                " * {}({}ch, {}hz)",
                d_name,
                d_cfg.channels(),
                d_cfg.sample_rate().0
            ),
            Err(_) => format!(" * {}", d_name),
        };
        if d_name == default_device {
            d.push_str(" [default]");
        }
        device_names.push(d);
    }
    Ok(device_names.join("\n"))
}
