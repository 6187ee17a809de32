//! CSV plumbing: archive pages in, cleaned tables out.

use crate::candle::{CandleSeries, KLINE_COLUMNS, RawPage, RawRow};
use crate::error::CacheError;
use csv::{ReaderBuilder, Writer, WriterBuilder};
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use tracing::warn;
use zip::ZipArchive;

/// Header of the presentation column that leads every cleaned table.
pub const HUMAN_TIME_COLUMN: &str = "Human_Time";
pub const HUMAN_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Reads headerless kline rows. Row widths are not enforced here; the
/// cleaner rejects short rows.
pub fn read_kline_csv<R: Read>(reader: R) -> Result<RawPage, csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut rows = Vec::new();
    for record in rdr.records() {
        let record = record?;
        rows.push(RawRow(record.iter().map(str::to_string).collect()));
    }
    Ok(RawPage::new(rows))
}

/// Decodes a daily archive: a zip holding a single CSV file.
pub fn decode_zip_page(bytes: &[u8]) -> Result<RawPage, CacheError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let entry = archive
        .file_names()
        .find(|name| name.ends_with(".csv"))
        .map(str::to_string)
        .ok_or(CacheError::EmptyArchive)?;

    let file = archive.by_name(&entry)?;
    Ok(read_kline_csv(file)?)
}

fn write_table<W: Write>(mut wtr: Writer<W>, series: &CandleSeries, last_n: usize) -> Result<W, csv::Error> {
    let mut header = vec![HUMAN_TIME_COLUMN];
    header.extend_from_slice(&KLINE_COLUMNS);
    wtr.write_record(&header)?;

    for (record, display) in series.tail_with_display(last_n) {
        let human = display
            .map(|t| t.format(HUMAN_TIME_FORMAT).to_string())
            .unwrap_or_default();
        let raw = record.to_raw();
        wtr.write_record(std::iter::once(human.as_str()).chain(raw.fields().iter().map(String::as_str)))?;
    }

    wtr.into_inner()
        .map_err(|e| csv::Error::from(std::io::Error::new(e.error().kind(), e.error().to_string())))
}

/// Persists a cleaned series with a header row, presentation time first.
pub fn write_cleaned_csv(path: &Path, series: &CandleSeries) -> Result<(), csv::Error> {
    let mut file = write_table(Writer::from_path(path)?, series, series.len())?;
    file.flush()?;
    Ok(())
}

/// Renders the trailing `last_n` records as CSV text (header included).
pub fn render_recent_csv(series: &CandleSeries, last_n: usize) -> Result<String, csv::Error> {
    let bytes = write_table(WriterBuilder::new().from_writer(Vec::new()), series, last_n)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Reads a table written by [`write_cleaned_csv`] back into raw rows. The
/// twelve kline fields are located by the `Open_time` header, so a leading
/// presentation column is skipped. A file without that header is read as
/// headerless kline rows.
pub fn read_cleaned_csv(path: &Path) -> Result<RawPage, csv::Error> {
    let mut rdr = ReaderBuilder::new().flexible(true).from_path(path)?;
    let header = rdr
        .headers()?
        .iter()
        .position(|h| h.trim() == KLINE_COLUMNS[0]);
    let Some(offset) = header else {
        warn!(path = %path.display(), "No Open_time header, reading as headerless kline rows");
        return read_kline_csv(File::open(path)?);
    };

    let mut rows = Vec::new();
    for record in rdr.records() {
        let record = record?;
        rows.push(RawRow(record.iter().skip(offset).map(str::to_string).collect()));
    }
    Ok(RawPage::new(rows))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cleaner::tests::series_from;
    use std::io::Write as _;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    pub(crate) fn zip_bytes(entry: &str, contents: &str) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file(entry, SimpleFileOptions::default()).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_read_kline_csv_allows_ragged_rows() {
        let csv = "1,2,3\n1709942400000,0.7,0.8,0.6,0.75,10,1709956799999,7,3,5,3.5,0\n";
        let page = read_kline_csv(csv.as_bytes()).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page.rows[0].fields().len(), 3);
        assert_eq!(page.rows[1].fields().len(), 12);
    }

    #[test]
    fn test_decode_zip_page() {
        let csv = "1709942400000,0.7,0.8,0.6,0.75,10,1709956799999,7,3,5,3.5,0\n\
                   1709956800000,0.75,0.9,0.7,0.85,11,1709971199999,8,4,6,4.0,0\n";
        let page = decode_zip_page(&zip_bytes("ADAUSDC-4h-2024-03-09.csv", csv)).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page.rows[1].fields()[4], "0.85");
    }

    #[test]
    fn test_decode_zip_without_csv_entry() {
        let err = decode_zip_page(&zip_bytes("README.txt", "hello")).unwrap_err();
        assert!(matches!(err, CacheError::EmptyArchive));
    }

    #[test]
    fn test_decode_garbage_is_zip_error() {
        let err = decode_zip_page(b"definitely not a zip").unwrap_err();
        assert!(matches!(err, CacheError::Zip(_)));
    }

    #[test]
    fn test_cleaned_table_header_and_human_time() {
        let series = series_from(&[(1_704_067_200_000, 1.0, 1.2, 0.9, 1.1)]);
        let text = render_recent_csv(&series, 10).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "Human_Time,Open_time,Open,High,Low,Close,Volume,Close_time,Quote_asset_volume,\
             Number_of_trades,Taker_buy_base_asset_volume,Taker_buy_quote_asset_volume,Ignore"
        );
        // 2024-01-01T00:00Z shown at UTC+8
        assert!(lines.next().unwrap().starts_with("2024-01-01 08:00:00,1704067200000,"));
    }

    #[test]
    fn test_render_recent_keeps_only_tail() {
        let series = series_from(&[
            (1_704_067_200_000, 1.0, 1.2, 0.9, 1.1),
            (1_704_081_600_000, 1.1, 1.3, 1.0, 1.2),
            (1_704_096_000_000, 1.2, 1.4, 1.1, 1.3),
        ]);
        let text = render_recent_csv(&series, 2).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(!text.contains(",1704067200000,"));
    }

    #[test]
    fn test_written_table_reads_back_to_same_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ADAUSDC_4h_Cleaned.csv");
        let series = series_from(&[
            (1_704_067_200_000, 1.0, 1.2, 0.9, 1.1),
            (1_704_081_600_000, 1.1, 1.3, 1.0, 1.2),
        ]);
        write_cleaned_csv(&path, &series).unwrap();

        let page = read_cleaned_csv(&path).unwrap();
        let expected: Vec<RawRow> = series.records().iter().map(|r| r.to_raw()).collect();
        assert_eq!(page.rows, expected);
    }

    #[test]
    fn test_headerless_file_keeps_first_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        std::fs::write(
            &path,
            "1709942400000,0.7,0.8,0.6,0.75,10,1709956799999,7,3,5,3.5,0\n\
             1709956800000,0.75,0.9,0.7,0.85,11,1709971199999,8,4,6,4.0,0\n",
        )
        .unwrap();

        let page = read_cleaned_csv(&path).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page.rows[0].fields()[0], "1709942400000");
    }
}
