use super::{Card, EnumerationError, KmsDevice, ScanoutPlane};
use drm::control::Device as ControlDevice;
use std::fmt;

/// Everything the device exposes about its current configuration, for
/// `--list`. Gathered best effort: objects that fail to query are skipped.
#[derive(Debug, Clone, Default)]
pub struct ResourceSummary {
    pub driver: Option<DriverSummary>,
    pub crtcs: Vec<CrtcSummary>,
    pub connectors: Vec<ConnectorSummary>,
    pub encoders: Vec<u32>,
    pub framebuffers: Vec<u32>,
    pub planes: Vec<ScanoutPlane>,
}

#[derive(Debug, Clone)]
pub struct DriverSummary {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct CrtcSummary {
    pub id: u32,
    pub framebuffer: u32,
    pub position: (u32, u32),
    pub mode: Option<ModeSummary>,
    pub gamma_length: u32,
}

#[derive(Debug, Clone)]
pub struct ModeSummary {
    pub name: String,
    pub size: (u16, u16),
    pub refresh: u32,
}

#[derive(Debug, Clone)]
pub struct ConnectorSummary {
    pub id: u32,
    pub interface: String,
    pub state: String,
}

impl Card {
    pub fn resources(&self) -> Result<ResourceSummary, EnumerationError> {
        let handles = self
            .resource_handles()
            .map_err(EnumerationError::Resources)?;

        let driver = drm::Device::get_driver(self).ok().map(|driver| DriverSummary {
            name: driver.name().to_string_lossy().into_owned(),
            description: driver.description().to_string_lossy().into_owned(),
        });

        let crtcs = handles
            .crtcs()
            .iter()
            .filter_map(|handle| self.get_crtc(*handle).ok())
            .map(|crtc| CrtcSummary {
                id: crtc.handle().into(),
                framebuffer: crtc.framebuffer().map_or(0, u32::from),
                position: crtc.position(),
                mode: crtc.mode().map(|mode| ModeSummary {
                    name: mode.name().to_string_lossy().into_owned(),
                    size: mode.size(),
                    refresh: mode.vrefresh(),
                }),
                gamma_length: crtc.gamma_length(),
            })
            .collect();

        let connectors = handles
            .connectors()
            .iter()
            .filter_map(|handle| self.get_connector(*handle, false).ok())
            .map(|connector| ConnectorSummary {
                id: connector.handle().into(),
                interface: format!("{:?}-{}", connector.interface(), connector.interface_id()),
                state: format!("{:?}", connector.state()),
            })
            .collect();

        Ok(ResourceSummary {
            driver,
            crtcs,
            connectors,
            encoders: handles.encoders().iter().map(|h| u32::from(*h)).collect(),
            framebuffers: handles.framebuffers().iter().map(|h| u32::from(*h)).collect(),
            planes: self.planes()?,
        })
    }
}

impl fmt::Display for ResourceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(driver) = &self.driver {
            writeln!(f, "driver {} ({})", driver.name, driver.description)?;
        }

        writeln!(f, "crtcs: {}", self.crtcs.len())?;
        for crtc in &self.crtcs {
            write!(
                f,
                "\t{:#x}: fb={:#x} pos=({}, {}) gamma={}",
                crtc.id, crtc.framebuffer, crtc.position.0, crtc.position.1, crtc.gamma_length
            )?;
            match &crtc.mode {
                Some(mode) => writeln!(
                    f,
                    " mode={} {}x{}@{}",
                    mode.name, mode.size.0, mode.size.1, mode.refresh
                )?,
                None => writeln!(f, " mode=none")?,
            }
        }

        writeln!(f, "connectors: {}", self.connectors.len())?;
        for connector in &self.connectors {
            writeln!(f, "\t{:#x}: {} {}", connector.id, connector.interface, connector.state)?;
        }

        writeln!(f, "encoders: {}", self.encoders.len())?;
        for encoder in &self.encoders {
            writeln!(f, "\t{encoder:#x}")?;
        }

        writeln!(f, "framebuffers: {}", self.framebuffers.len())?;
        for fb in &self.framebuffers {
            writeln!(f, "\t{fb:#x}")?;
        }

        writeln!(f, "planes: {}", self.planes.len())?;
        for plane in &self.planes {
            writeln!(
                f,
                "\t{}: fb={:#x} crtc={:#x} possible_crtcs={:#x} src=({}, {}) crtc_pos=({}, {}) gamma={}",
                plane.id,
                plane.framebuffer.map_or(0, |fb| fb.get()),
                plane.crtc.unwrap_or(0),
                plane.possible_crtcs,
                plane.geometry.x,
                plane.geometry.y,
                plane.geometry.crtc_x,
                plane.geometry.crtc_y,
                plane.gamma_size,
            )?;
        }
        Ok(())
    }
}
