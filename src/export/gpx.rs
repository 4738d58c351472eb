use chrono::SecondsFormat;
use std::fs;
use std::path::{Path, PathBuf};

use super::Exporter;
use crate::error::ExportError;
use crate::session::LogRow;

/// GPX 1.1 track for mapping applications.
pub struct GpxTrack {
    pub name: String,
    pub points: Vec<GpxPoint>,
}

pub struct GpxPoint {
    pub lat: f64,
    pub lon: f64,
    pub ele: Option<f64>,
    pub time: String,
    pub heart_rate: Option<f64>,
}

impl GpxTrack {
    /// Positioned rows only; elevation prefers the barometer.
    pub fn from_rows(name: &str, rows: &[LogRow]) -> Self {
        let points = rows
            .iter()
            .filter_map(|r| {
                let (lat, lon) = r.position()?;
                Some(GpxPoint {
                    lat,
                    lon,
                    ele: r.altitude.or(r.gps_altitude),
                    time: r.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
                    heart_rate: r.heart_rate,
                })
            })
            .collect();
        GpxTrack { name: name.to_string(), points }
    }

    pub fn to_gpx_xml(&self) -> String {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str("<gpx version=\"1.1\" creator=\"ridelog\" ");
        xml.push_str("xmlns=\"http://www.topografix.com/GPX/1/1\">\n");
        xml.push_str("  <trk>\n");
        xml.push_str(&format!("    <name>{}</name>\n", self.name));
        xml.push_str("    <trkseg>\n");

        for p in &self.points {
            xml.push_str(&format!("      <trkpt lat=\"{:.7}\" lon=\"{:.7}\">\n", p.lat, p.lon));
            if let Some(ele) = p.ele {
                xml.push_str(&format!("        <ele>{ele:.1}</ele>\n"));
            }
            xml.push_str(&format!("        <time>{}</time>\n", p.time));
            if let Some(hr) = p.heart_rate {
                xml.push_str(&format!(
                    "        <extensions><hr>{}</hr></extensions>\n",
                    hr.round() as i64
                ));
            }
            xml.push_str("      </trkpt>\n");
        }

        xml.push_str("    </trkseg>\n");
        xml.push_str("  </trk>\n");
        xml.push_str("</gpx>\n");
        xml
    }
}

pub struct GpxExporter;

impl Exporter for GpxExporter {
    fn name(&self) -> &'static str {
        "gpx"
    }

    fn export(&self, rows: &[LogRow], dir: &Path, session: &str) -> Result<PathBuf, ExportError> {
        let track = GpxTrack::from_rows(session, rows);
        if track.points.is_empty() {
            log::info!("gpx: no positioned rows in {session}");
        }
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{session}.gpx"));
        fs::write(&path, track.to_gpx_xml())?;
        Ok(path)
    }
}
