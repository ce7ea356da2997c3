//! Device calls and their rendering per device family

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::camera::{Camera, DeviceFamily, PtzPosition};
use crate::relay::soap;

/// VAPIX zoom steps span `1..=9999`
const VAPIX_ZOOM_STEPS: f64 = 9998.0;

/// One logical operation against a camera
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    AbsoluteMove { pan: f64, tilt: f64, zoom: f64 },
    RelativeMove { pan: f64, tilt: f64, zoom: f64 },
    /// Speeds in `[-1, 1]`
    ContinuousMove {
        pan_speed: f64,
        tilt_speed: f64,
        zoom_speed: f64,
    },
    Stop,
    QueryPosition,
    ConfigureStream {
        resolution: Option<String>,
        framerate: Option<u32>,
    },
    DeviceInfo,
}

impl DeviceCall {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCall::AbsoluteMove { .. } => "absolute_move",
            DeviceCall::RelativeMove { .. } => "relative_move",
            DeviceCall::ContinuousMove { .. } => "continuous_move",
            DeviceCall::Stop => "stop",
            DeviceCall::QueryPosition => "query_position",
            DeviceCall::ConfigureStream { .. } => "configure_stream",
            DeviceCall::DeviceInfo => "device_info",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    Get,
    Post,
}

/// Wire-level request, independent of route and authentication
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRequest {
    pub method: RequestMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Unwrapped SOAP body for ONVIF calls; the transport adds envelope and security
    pub body: Option<String>,
}

impl DeviceRequest {
    fn get(path: &str, query: Vec<(&str, String)>) -> Self {
        Self {
            method: RequestMethod::Get,
            path: path.to_string(),
            query: query
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            body: None,
        }
    }

    fn soap(path: &str, body: String) -> Self {
        Self {
            method: RequestMethod::Post,
            path: path.to_string(),
            query: Vec::new(),
            body: Some(body),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub model: Option<String>,
    pub firmware_version: Option<String>,
    pub serial_number: Option<String>,
    pub mac_address: Option<String>,
}

pub fn render(call: &DeviceCall, camera: &Camera, profile_token: &str) -> DeviceRequest {
    match camera.family {
        DeviceFamily::Vapix => render_vapix(call, camera),
        DeviceFamily::Onvif => render_onvif(call, camera, profile_token),
    }
}

fn render_vapix(call: &DeviceCall, camera: &Camera) -> DeviceRequest {
    const PTZ_CGI: &str = "/axis-cgi/com/ptz.cgi";
    let zoom = camera.limits.zoom;

    match call {
        DeviceCall::AbsoluteMove { pan, tilt, zoom: z } => DeviceRequest::get(
            PTZ_CGI,
            vec![
                ("camera", "1".to_string()),
                ("pan", format!("{:.2}", pan)),
                ("tilt", format!("{:.2}", tilt)),
                (
                    "zoom",
                    format!("{}", (1.0 + zoom.normalize_unit(*z) * VAPIX_ZOOM_STEPS).round()),
                ),
            ],
        ),
        DeviceCall::RelativeMove { pan, tilt, zoom: z } => {
            let steps = if zoom.span() > 0.0 {
                (z / zoom.span() * VAPIX_ZOOM_STEPS).round()
            } else {
                0.0
            };
            DeviceRequest::get(
                PTZ_CGI,
                vec![
                    ("camera", "1".to_string()),
                    ("rpan", format!("{:.2}", pan)),
                    ("rtilt", format!("{:.2}", tilt)),
                    ("rzoom", format!("{}", steps)),
                ],
            )
        }
        DeviceCall::ContinuousMove {
            pan_speed,
            tilt_speed,
            zoom_speed,
        } => DeviceRequest::get(
            PTZ_CGI,
            vec![
                ("camera", "1".to_string()),
                (
                    "continuouspantiltmove",
                    format!("{},{}", vapix_speed(*pan_speed), vapix_speed(*tilt_speed)),
                ),
                ("continuouszoommove", format!("{}", vapix_speed(*zoom_speed))),
            ],
        ),
        DeviceCall::Stop => DeviceRequest::get(
            PTZ_CGI,
            vec![
                ("camera", "1".to_string()),
                ("continuouspantiltmove", "0,0".to_string()),
                ("continuouszoommove", "0".to_string()),
            ],
        ),
        DeviceCall::QueryPosition => DeviceRequest::get(
            PTZ_CGI,
            vec![("camera", "1".to_string()), ("query", "position".to_string())],
        ),
        DeviceCall::ConfigureStream {
            resolution,
            framerate,
        } => {
            let mut query = vec![("action", "update".to_string())];
            if let Some(resolution) = resolution {
                query.push(("Image.I0.Appearance.Resolution", resolution.clone()));
            }
            if let Some(fps) = framerate {
                query.push(("Image.I0.Stream.FPS", fps.to_string()));
            }
            if query.len() == 1 {
                // Nothing to change: read the group back to confirm the stream exists.
                query = vec![
                    ("action", "list".to_string()),
                    ("group", "Image.I0.Appearance".to_string()),
                ];
            }
            DeviceRequest::get("/axis-cgi/param.cgi", query)
        }
        DeviceCall::DeviceInfo => DeviceRequest::get("/axis-cgi/basicdeviceinfo.cgi", Vec::new()),
    }
}

fn vapix_speed(speed: f64) -> i32 {
    (speed.clamp(-1.0, 1.0) * 100.0).round() as i32
}

fn render_onvif(call: &DeviceCall, camera: &Camera, profile_token: &str) -> DeviceRequest {
    const PTZ_SERVICE: &str = "/onvif/ptz_service";
    let limits = camera.limits;

    match call {
        DeviceCall::AbsoluteMove { pan, tilt, zoom } => DeviceRequest::soap(
            PTZ_SERVICE,
            format!(
                r#"<tptz:AbsoluteMove>
  <tptz:ProfileToken>{}</tptz:ProfileToken>
  <tptz:Position>
    <tt:PanTilt x="{:.4}" y="{:.4}"/>
    <tt:Zoom x="{:.4}"/>
  </tptz:Position>
</tptz:AbsoluteMove>"#,
                profile_token,
                limits.pan.normalize_signed(*pan),
                limits.tilt.normalize_signed(*tilt),
                limits.zoom.normalize_unit(*zoom)
            ),
        ),
        DeviceCall::RelativeMove { pan, tilt, zoom } => {
            let half = |span: f64| if span > 0.0 { span / 2.0 } else { 1.0 };
            let full = |span: f64| if span > 0.0 { span } else { 1.0 };
            DeviceRequest::soap(
                PTZ_SERVICE,
                format!(
                    r#"<tptz:RelativeMove>
  <tptz:ProfileToken>{}</tptz:ProfileToken>
  <tptz:Translation>
    <tt:PanTilt x="{:.4}" y="{:.4}"/>
    <tt:Zoom x="{:.4}"/>
  </tptz:Translation>
</tptz:RelativeMove>"#,
                    profile_token,
                    pan / half(limits.pan.span()),
                    tilt / half(limits.tilt.span()),
                    zoom / full(limits.zoom.span())
                ),
            )
        }
        DeviceCall::ContinuousMove {
            pan_speed,
            tilt_speed,
            zoom_speed,
        } => DeviceRequest::soap(
            PTZ_SERVICE,
            format!(
                r#"<tptz:ContinuousMove>
  <tptz:ProfileToken>{}</tptz:ProfileToken>
  <tptz:Velocity>
    <tt:PanTilt x="{:.2}" y="{:.2}"/>
    <tt:Zoom x="{:.2}"/>
  </tptz:Velocity>
</tptz:ContinuousMove>"#,
                profile_token, pan_speed, tilt_speed, zoom_speed
            ),
        ),
        DeviceCall::Stop => DeviceRequest::soap(
            PTZ_SERVICE,
            format!(
                r#"<tptz:Stop>
  <tptz:ProfileToken>{}</tptz:ProfileToken>
  <tptz:PanTilt>true</tptz:PanTilt>
  <tptz:Zoom>true</tptz:Zoom>
</tptz:Stop>"#,
                profile_token
            ),
        ),
        DeviceCall::QueryPosition => DeviceRequest::soap(
            PTZ_SERVICE,
            format!(
                "<tptz:GetStatus><tptz:ProfileToken>{}</tptz:ProfileToken></tptz:GetStatus>",
                profile_token
            ),
        ),
        // ONVIF encoders are configured out of band; confirm the stream is servable.
        DeviceCall::ConfigureStream { .. } => DeviceRequest::soap(
            "/onvif/media_service",
            format!(
                r#"<trt:GetStreamUri>
  <trt:StreamSetup>
    <tt:Stream>RTP-Unicast</tt:Stream>
    <tt:Transport><tt:Protocol>RTSP</tt:Protocol></tt:Transport>
  </trt:StreamSetup>
  <trt:ProfileToken>{}</trt:ProfileToken>
</trt:GetStreamUri>"#,
                profile_token
            ),
        ),
        DeviceCall::DeviceInfo => DeviceRequest::soap(
            "/onvif/device_service",
            "<tds:GetDeviceInformation/>".to_string(),
        ),
    }
}

/// Reads a PTZ position out of a QueryPosition response
pub fn parse_position(camera: &Camera, body: &str) -> Option<PtzPosition> {
    let limits = camera.limits;
    match camera.family {
        DeviceFamily::Vapix => {
            let values = parse_key_values(body);
            let pan = values.get("pan")?.parse::<f64>().ok()?;
            let tilt = values.get("tilt")?.parse::<f64>().ok()?;
            let zoom = values
                .get("zoom")
                .and_then(|z| z.parse::<f64>().ok())
                .map(|steps| limits.zoom.denormalize_unit((steps - 1.0) / VAPIX_ZOOM_STEPS))
                .unwrap_or(camera.ptz_position.zoom);
            Some(PtzPosition { pan, tilt, zoom })
        }
        DeviceFamily::Onvif => {
            let pan_tilt = soap::element_attributes(body, "PanTilt")?;
            let x = pan_tilt.get("x")?.parse::<f64>().ok()?;
            let y = pan_tilt.get("y")?.parse::<f64>().ok()?;
            let zoom = soap::element_attributes(body, "Zoom")
                .and_then(|z| z.get("x").and_then(|v| v.parse::<f64>().ok()))
                .map(|z| limits.zoom.denormalize_unit(z))
                .unwrap_or(camera.ptz_position.zoom);
            Some(PtzPosition {
                pan: limits.pan.denormalize_signed(x),
                tilt: limits.tilt.denormalize_signed(y),
                zoom,
            })
        }
    }
}

pub fn parse_device_info(family: DeviceFamily, body: &str) -> DeviceInfo {
    match family {
        DeviceFamily::Vapix => {
            let values = parse_key_values(body);
            DeviceInfo {
                model: values.get("prodnbr").or_else(|| values.get("model")).cloned(),
                firmware_version: values.get("version").cloned(),
                serial_number: values.get("serialnumber").cloned(),
                mac_address: values.get("macaddress").cloned(),
            }
        }
        DeviceFamily::Onvif => {
            let texts = soap::element_texts(
                body,
                &["Model", "FirmwareVersion", "SerialNumber", "HardwareId"],
            );
            DeviceInfo {
                model: texts.get("Model").cloned(),
                firmware_version: texts.get("FirmwareVersion").cloned(),
                serial_number: texts.get("SerialNumber").cloned(),
                mac_address: texts.get("HardwareId").cloned(),
            }
        }
    }
}

/// `key=value` lines, keys lowercased
fn parse_key_values(body: &str) -> HashMap<String, String> {
    body.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect()
}
