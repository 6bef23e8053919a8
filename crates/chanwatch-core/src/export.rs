//! CSV / JSON export of crawl results.

use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Serialize;

use crate::{
    crawler::{ChannelMetadata, CrawlReport},
    domain::Message,
    errors::Error,
    Result,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(Error::Config(format!(
                "unsupported export format {other:?} (expected json or csv)"
            ))),
        }
    }
}

/// One exported message. Field order is the column order.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct MessageExport {
    pub channel_title: String,
    pub channel_username: String,
    pub message_id: i32,
    pub date: String,
    pub message: String,
    pub url: String,
}

const MESSAGE_HEADERS: [&str; 6] = [
    "Channel Title",
    "Channel Username",
    "Message ID",
    "Date",
    "Message",
    "URL",
];

impl From<&Message> for MessageExport {
    fn from(m: &Message) -> Self {
        Self {
            channel_title: m.channel_title.clone(),
            channel_username: m.channel_handle.clone().unwrap_or_default(),
            message_id: m.message_id.0,
            date: m.timestamp.to_rfc3339(),
            message: m.body.clone(),
            url: m.permalink.clone(),
        }
    }
}

impl MessageExport {
    fn row(&self) -> [String; 6] {
        [
            self.channel_title.clone(),
            self.channel_username.clone(),
            self.message_id.to_string(),
            self.date.clone(),
            self.message.clone(),
            self.url.clone(),
        ]
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ChannelMetadataExport {
    pub channel_title: String,
    pub channel_username: String,
    pub channel_link: String,
    pub channel_admins: String,
    pub member_count: u32,
    pub user_join_date: String,
}

const METADATA_HEADERS: [&str; 6] = [
    "Channel Title",
    "Channel Username",
    "Channel Link",
    "Channel Admins",
    "Member Count",
    "User Join Date",
];

impl From<&ChannelMetadata> for ChannelMetadataExport {
    fn from(m: &ChannelMetadata) -> Self {
        let ch = &m.channel;
        Self {
            channel_title: ch.title.clone(),
            channel_username: ch.handle.clone().unwrap_or_default(),
            channel_link: ch.link(),
            channel_admins: ch.admin_handles.join(", "),
            member_count: ch.member_count,
            user_join_date: ch
                .first_contact
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
        }
    }
}

impl ChannelMetadataExport {
    fn row(&self) -> [String; 6] {
        [
            self.channel_title.clone(),
            self.channel_username.clone(),
            self.channel_link.clone(),
            self.channel_admins.clone(),
            self.member_count.to_string(),
            self.user_join_date.clone(),
        ]
    }
}

/// Write `<query>_messages.<ext>` and `<query>_channel_metadata.<ext>` into
/// `dir`. Nothing is written when the crawl found no messages.
pub fn export_report(dir: &Path, format: ExportFormat, report: &CrawlReport) -> Result<Vec<PathBuf>> {
    if report.messages.is_empty() {
        return Ok(Vec::new());
    }
    fs::create_dir_all(dir)?;

    let stem = file_stem(&report.query);
    let ext = format.extension();
    let messages_path = dir.join(format!("{stem}_messages.{ext}"));
    let metadata_path = dir.join(format!("{stem}_channel_metadata.{ext}"));

    let messages: Vec<MessageExport> = report.messages.iter().map(MessageExport::from).collect();
    let metadata: Vec<ChannelMetadataExport> = report
        .metadata
        .iter()
        .map(ChannelMetadataExport::from)
        .collect();

    match format {
        ExportFormat::Json => {
            write_json(&messages_path, &messages)?;
            write_json(&metadata_path, &metadata)?;
        }
        ExportFormat::Csv => {
            write_csv(
                &messages_path,
                &MESSAGE_HEADERS,
                messages.iter().map(MessageExport::row),
            )?;
            write_csv(
                &metadata_path,
                &METADATA_HEADERS,
                metadata.iter().map(ChannelMetadataExport::row),
            )?;
        }
    }

    tracing::info!(
        messages = %messages_path.display(),
        metadata = %metadata_path.display(),
        "export written"
    );
    Ok(vec![messages_path, metadata_path])
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut txt = serde_json::to_string_pretty(value)?;
    txt.push('\n');
    fs::write(path, txt)?;
    Ok(())
}

fn write_csv<const N: usize>(
    path: &Path,
    headers: &[&str; N],
    rows: impl Iterator<Item = [String; N]>,
) -> Result<()> {
    let csv_err = |e: csv::Error| Error::External(format!("csv write to {}: {e}", path.display()));

    let mut w = csv::Writer::from_path(path).map_err(csv_err)?;
    w.write_record(headers).map_err(csv_err)?;
    for row in rows {
        w.write_record(&row).map_err(csv_err)?;
    }
    w.flush()?;
    Ok(())
}

/// File-name-safe form of the searched handle or id.
fn file_stem(query: &str) -> String {
    let cleaned: String = query
        .trim()
        .trim_start_matches('@')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "export".to_string()
    } else {
        cleaned
    }
}
