//! mwTab text parser.
//!
//! Turns the full text of a Metabolomics Workbench mwTab export into an
//! [`MwTabDocument`]: header fields plus a list of [`Section`]s, each either
//! a key-value block or a data table.
//!
//! ```text
//! #METABOLOMICS WORKBENCH STUDY_ID:ST000315 ANALYSIS_ID:AN000501
//! VERSION             	1
//! #SUBJECT_SAMPLE_FACTORS:	SUBJECT(optional)[tab]SAMPLE[tab]FACTORS[tab]Additional sample data
//! SUBJECT_SAMPLE_FACTORS	-	S1	Group:Exercise | Visit:1
//! #MS_METABOLITE_DATA
//! MS_METABOLITE_DATA:UNITS	mM
//! MS_METABOLITE_DATA_START
//! Samples	S1
//! Glucose	12.5
//! MS_METABOLITE_DATA_END
//! #END
//! ```
//!
//! Anomalies such as ragged rows or unparseable cells become [`Warning`]s
//! and parsing continues. Only a missing header marker or a missing
//! `STUDY_ID` fails the parse, and then no document is returned.
//!
//! The parser is pure: no I/O, no persistence.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::detect::mwtab_marker;
use crate::error::{ParseFailure, Warning};

pub const SAMPLE_FACTORS_SECTION: &str = "SUBJECT_SAMPLE_FACTORS";
pub const ANNOTATION_TABLE: &str = "METABOLITES";

/// Header keys that may appear on standalone lines anywhere outside tables.
const STANDALONE_HEADER_KEYS: &[&str] = &["STUDY_ID", "ANALYSIS_ID", "PROJECT_ID"];

/// Cell spellings that mean "no reading".
const MISSING_TOKENS: &[&str] = &["", "NA", "N/A", "NULL", "-", ".", "NAN"];

/// Parsed document plus the warnings raised while producing it.
#[derive(Debug, Clone)]
pub struct Parsed {
    pub document: MwTabDocument,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MwTabDocument {
    /// Header fields from the marker line and standalone header lines.
    /// The first value seen for a key wins.
    pub header: BTreeMap<String, String>,
    pub study_id: String,
    pub analysis_id: Option<String>,
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub name: String,
    /// Line on which the section (or its table) opened.
    pub line: usize,
    pub body: SectionBody,
}

/// The two section shapes found in mwTab files.
#[derive(Debug, Clone, PartialEq)]
pub enum SectionBody {
    KeyValue(Vec<KeyValueRow>),
    Table(DataTable),
}

/// One line of a key-value block.
///
/// For `SUBJECT_SAMPLE_FACTORS` rows, `key` is the sample label, `value`
/// the raw factor string, `subject` the optional subject id and `extra` the
/// additional sample data. For metadata sections (`ST:STUDY_TITLE ...`),
/// `key` is the field name as written and `value` the rest of the line.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValueRow {
    pub line: usize,
    pub key: String,
    pub value: String,
    pub subject: Option<String>,
    pub extra: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataTable {
    /// Unit from a `NAME:UNITS` line, applying to every cell of the table.
    pub units: Option<String>,
    /// First cell of the header row, e.g. `Samples` or `metabolite_name`.
    pub row_label: String,
    /// Remaining header cells. For measurement tables, sample labels.
    pub columns: Vec<String>,
    /// Per-column factor text from an optional `Factors` row.
    pub column_factors: Vec<Option<String>>,
    pub rows: Vec<DataRow>,
    /// False when input ended before `NAME_END`.
    pub terminated: bool,
    pub measurement: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataRow {
    pub line: usize,
    /// Feature name from the first cell, trimmed.
    pub name: String,
    /// One cell per present column, aligned with [`DataTable::columns`].
    /// Shorter than `columns` for ragged rows.
    pub cells: Vec<Cell>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Value(f64),
    Missing,
    Text(String),
}

impl Cell {
    /// The numeric reading of a measurement cell; `Some(None)` is missing.
    pub fn reading(&self) -> Option<Option<f64>> {
        match self {
            Cell::Value(v) => Some(Some(*v)),
            Cell::Missing => Some(None),
            Cell::Text(_) => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl MwTabDocument {
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Rows of every `SUBJECT_SAMPLE_FACTORS` block, in file order.
    pub fn sample_factor_rows(&self) -> impl Iterator<Item = &KeyValueRow> {
        self.sections
            .iter()
            .filter(|s| s.name == SAMPLE_FACTORS_SECTION)
            .flat_map(|s| match &s.body {
                SectionBody::KeyValue(rows) => rows.as_slice(),
                SectionBody::Table(_) => &[],
            })
    }

    /// Measurement tables paired with their section name.
    pub fn measurement_tables(&self) -> impl Iterator<Item = (&str, &DataTable)> {
        self.sections.iter().filter_map(|s| match &s.body {
            SectionBody::Table(t) if t.measurement => Some((s.name.as_str(), t)),
            _ => None,
        })
    }
}

impl DataTable {
    fn new(units: Option<String>, measurement: bool) -> Self {
        Self {
            units,
            row_label: String::new(),
            columns: Vec::new(),
            column_factors: Vec::new(),
            rows: Vec::new(),
            terminated: false,
            measurement,
        }
    }

    fn has_header(&self) -> bool {
        !self.row_label.is_empty() || !self.columns.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }
}

enum State {
    /// Before the first `#` section.
    Preamble,
    /// Inside the key-value section at this index.
    Block(usize),
    /// Inside an open table at this section index.
    Table(usize),
}

struct Parser {
    header: BTreeMap<String, String>,
    header_seen: bool,
    sections: Vec<Section>,
    pending_units: HashMap<String, String>,
    state: State,
    warnings: Vec<Warning>,
}

/// Parse mwTab text.
pub fn parse(text: &str) -> Result<Parsed, ParseFailure> {
    let mut parser = Parser {
        header: BTreeMap::new(),
        header_seen: false,
        sections: Vec::new(),
        pending_units: HashMap::new(),
        state: State::Preamble,
        warnings: Vec::new(),
    };

    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    for (idx, raw) in text.lines().enumerate() {
        if !parser.line(idx + 1, raw)? {
            break;
        }
    }
    parser.finish()
}

impl Parser {
    /// Feed one line. Returns `Ok(false)` at `#END`.
    fn line(&mut self, n: usize, raw: &str) -> Result<bool, ParseFailure> {
        let line = raw.trim_end();
        if line.trim().is_empty() {
            return Ok(true);
        }

        if let State::Table(idx) = self.state {
            let name = self.sections[idx].name.clone();
            if is_table_end(line, &name) {
                self.table_mut(idx).terminated = true;
                self.state = State::Block(idx);
                return Ok(true);
            }
            if let Some((table, unit)) = units_line(line) {
                self.set_units(table, unit);
                return Ok(true);
            }
            if let Some(unit) = bare_units(line) {
                self.table_mut(idx).units = Some(unit);
                return Ok(true);
            }
            if !line.starts_with('#') {
                // Trailing tabs are empty cells, not padding.
                self.table_row(idx, n, raw.trim_end_matches(['\r', '\n']));
                return Ok(true);
            }
            self.warnings.push(Warning::at(
                n,
                format!("table {} not closed before next section", name),
            ));
            self.state = State::Block(idx);
        }

        if let Some(tokens) = mwtab_marker(line) {
            if self.header_seen {
                self.warnings
                    .push(Warning::at(n, "repeated header marker ignored"));
            } else {
                self.header_seen = true;
                self.header_tokens(tokens);
            }
            return Ok(true);
        }

        if let Some(rest) = line.strip_prefix('#') {
            if !self.header_seen {
                return Err(ParseFailure::MissingHeader);
            }
            let name = section_name(rest);
            if name == "END" {
                return Ok(false);
            }
            self.sections.push(Section {
                name,
                line: n,
                body: SectionBody::KeyValue(Vec::new()),
            });
            self.state = State::Block(self.sections.len() - 1);
            return Ok(true);
        }

        if !self.header_seen {
            self.warnings
                .push(Warning::at(n, "text before header marker ignored"));
            return Ok(true);
        }

        if let Some((key, value)) = standalone_header(line) {
            self.header
                .entry(key.to_string())
                .or_insert_with(|| value.to_string());
            return Ok(true);
        }

        if let Some((table, unit)) = units_line(line) {
            self.set_units(table, unit);
            return Ok(true);
        }

        if let Some(table) = table_start(line) {
            self.open_table(n, table);
            return Ok(true);
        }

        match self.state {
            State::Preamble => {
                let (key, value) = split_key_value(line);
                self.header
                    .entry(key.to_string())
                    .or_insert_with(|| value.to_string());
            }
            State::Block(idx) => self.block_row(idx, n, raw.trim_end_matches(['\r', '\n'])),
            State::Table(_) => unreachable!("table rows are handled above"),
        }
        Ok(true)
    }

    fn finish(mut self) -> Result<Parsed, ParseFailure> {
        if !self.header_seen {
            return Err(ParseFailure::MissingHeader);
        }
        if let State::Table(idx) = self.state {
            let name = self.sections[idx].name.clone();
            self.warnings.push(Warning::general(format!(
                "table {} reached end of input without {}_END",
                name, name
            )));
        }

        let study_id = self
            .header
            .get("STUDY_ID")
            .filter(|s| !s.is_empty())
            .cloned()
            .ok_or(ParseFailure::MissingStudyId)?;
        let analysis_id = self
            .header
            .get("ANALYSIS_ID")
            .filter(|s| !s.is_empty())
            .cloned();

        Ok(Parsed {
            document: MwTabDocument {
                header: self.header,
                study_id,
                analysis_id,
                sections: self.sections,
            },
            warnings: self.warnings,
        })
    }

    fn header_tokens(&mut self, rest: &str) {
        for token in rest.split_whitespace() {
            if let Some((key, value)) = token.split_once(':') {
                if !key.is_empty() && !value.is_empty() {
                    self.header
                        .entry(key.to_string())
                        .or_insert_with(|| value.to_string());
                }
            }
        }
    }

    fn table_mut(&mut self, idx: usize) -> &mut DataTable {
        match &mut self.sections[idx].body {
            SectionBody::Table(t) => t,
            SectionBody::KeyValue(_) => unreachable!("state points at a table section"),
        }
    }

    /// Attach a unit to the latest table of that name, or hold it until the
    /// table opens.
    fn set_units(&mut self, table: String, unit: String) {
        let existing = self
            .sections
            .iter_mut()
            .rev()
            .filter(|s| s.name == table)
            .find_map(|s| match &mut s.body {
                SectionBody::Table(t) => Some(t),
                SectionBody::KeyValue(_) => None,
            });
        match existing {
            Some(t) => t.units = Some(unit),
            None => {
                self.pending_units.insert(table, unit);
            }
        }
    }

    fn open_table(&mut self, n: usize, name: String) {
        let units = self.pending_units.remove(&name);
        let table = DataTable::new(units, is_measurement_table(&name));

        // `#MS_METABOLITE_DATA` followed directly by its `_START` line holds
        // nothing else, so the table takes over that section.
        let reuse = match self.state {
            State::Block(idx) => {
                let section = &self.sections[idx];
                section.name == name
                    && matches!(&section.body, SectionBody::KeyValue(rows) if rows.is_empty())
            }
            _ => false,
        };

        if reuse {
            if let State::Block(idx) = self.state {
                self.sections[idx].body = SectionBody::Table(table);
                self.sections[idx].line = n;
                self.state = State::Table(idx);
            }
        } else {
            self.sections.push(Section {
                name,
                line: n,
                body: SectionBody::Table(table),
            });
            self.state = State::Table(self.sections.len() - 1);
        }
    }

    fn block_row(&mut self, idx: usize, n: usize, line: &str) {
        let section_name = self.sections[idx].name.clone();
        let row = if section_name == SAMPLE_FACTORS_SECTION {
            match self.sample_factor_row(n, line) {
                Some(row) => row,
                None => return,
            }
        } else {
            if matches!(self.sections[idx].body, SectionBody::Table(_)) {
                self.warnings.push(Warning::at(
                    n,
                    format!("line after {}_END ignored", section_name),
                ));
                return;
            }
            let (key, value) = split_key_value(line);
            KeyValueRow {
                line: n,
                key: key.to_string(),
                value: value.to_string(),
                subject: None,
                extra: Vec::new(),
            }
        };

        if let SectionBody::KeyValue(rows) = &mut self.sections[idx].body {
            rows.push(row);
        }
    }

    fn sample_factor_row(&mut self, n: usize, line: &str) -> Option<KeyValueRow> {
        if !line.starts_with(SAMPLE_FACTORS_SECTION) {
            self.warnings.push(Warning::at(
                n,
                "unexpected line in SUBJECT_SAMPLE_FACTORS section ignored",
            ));
            return None;
        }

        let parts: Vec<&str> = line.split('\t').map(str::trim).collect();
        if parts.len() < 4 {
            self.warnings.push(Warning::at(
                n,
                format!(
                    "SUBJECT_SAMPLE_FACTORS row has {} fields, expected at least 4",
                    parts.len()
                ),
            ));
            return None;
        }
        if parts.len() > 5 && parts[5..].iter().any(|p| !p.is_empty()) {
            self.warnings.push(Warning::at(
                n,
                format!(
                    "SUBJECT_SAMPLE_FACTORS row has {} fields, extra fields ignored",
                    parts.len()
                ),
            ));
        }

        let label = parts[2];
        if label.is_empty() {
            self.warnings
                .push(Warning::at(n, "SUBJECT_SAMPLE_FACTORS row with empty sample label"));
            return None;
        }

        let subject = match parts[1] {
            "" | "-" => None,
            s => Some(s.to_string()),
        };
        let extra = parts
            .get(4)
            .map(|data| self.additional_data(n, data))
            .unwrap_or_default();

        Some(KeyValueRow {
            line: n,
            key: label.to_string(),
            value: parts[3].to_string(),
            subject,
            extra,
        })
    }

    /// `key=value` pairs separated by `;`.
    fn additional_data(&mut self, n: usize, data: &str) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for segment in data.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            match segment.split_once('=') {
                Some((k, v)) if !k.trim().is_empty() => {
                    pairs.push((k.trim().to_string(), v.trim().to_string()));
                }
                _ => self.warnings.push(Warning::at(
                    n,
                    format!("additional sample data '{}' is not key=value", segment),
                )),
            }
        }
        pairs
    }

    fn table_row(&mut self, idx: usize, n: usize, line: &str) {
        let mut cells: Vec<&str> = line.split('\t').map(str::trim).collect();
        let table_name = self.sections[idx].name.clone();

        if !self.table_mut(idx).has_header() {
            while cells.len() > 1 && cells.last().is_some_and(|c| c.is_empty()) {
                cells.pop();
            }
            let table = self.table_mut(idx);
            table.row_label = cells[0].to_string();
            table.columns = cells[1..].iter().map(|c| c.to_string()).collect();
            table.column_factors = vec![None; table.columns.len()];
            let measurement = table.measurement;
            let columns = table.columns.clone();
            if measurement {
                self.check_columns(n, &table_name, &columns);
            }
            return;
        }

        let width = self.table_mut(idx).columns.len();
        let present = cells.len().saturating_sub(1);
        if present > width {
            if cells[width + 1..].iter().all(|c| c.is_empty()) {
                cells.truncate(width + 1);
            } else {
                self.warnings.push(Warning::at(
                    n,
                    format!(
                        "{} row has {} values for {} columns, extra values ignored",
                        table_name, present, width
                    ),
                ));
                cells.truncate(width + 1);
            }
        } else if present < width {
            self.warnings.push(Warning::at(
                n,
                format!(
                    "{} row has {} values for {} columns",
                    table_name, present, width
                ),
            ));
        }

        let name = cells[0];
        let measurement = self.table_mut(idx).measurement;

        if measurement && name.eq_ignore_ascii_case("factors") {
            let factors: Vec<Option<String>> = (0..width)
                .map(|i| {
                    cells
                        .get(i + 1)
                        .filter(|c| !c.is_empty() && **c != "-")
                        .map(|c| c.to_string())
                })
                .collect();
            self.table_mut(idx).column_factors = factors;
            return;
        }

        if name.is_empty() {
            self.warnings.push(Warning::at(
                n,
                format!("{} row without a feature name skipped", table_name),
            ));
            return;
        }

        let values: Vec<Cell> = cells[1..]
            .iter()
            .map(|raw| {
                if measurement {
                    self.reading(n, raw)
                } else if is_missing(raw) {
                    Cell::Missing
                } else {
                    Cell::Text(raw.to_string())
                }
            })
            .collect();

        self.table_mut(idx).rows.push(DataRow {
            line: n,
            name: name.to_string(),
            cells: values,
        });
    }

    fn check_columns(&mut self, n: usize, table: &str, columns: &[String]) {
        let mut seen = HashSet::new();
        for (i, col) in columns.iter().enumerate() {
            if col.is_empty() {
                self.warnings.push(Warning::at(
                    n,
                    format!("{} column {} has an empty sample label", table, i + 1),
                ));
            } else if !seen.insert(col.as_str()) {
                self.warnings.push(Warning::at(
                    n,
                    format!("{} repeats sample column '{}'", table, col),
                ));
            }
        }
    }

    fn reading(&mut self, n: usize, raw: &str) -> Cell {
        match parse_reading(raw) {
            Some(cell) => cell,
            None => {
                self.warnings.push(Warning::at(
                    n,
                    format!("value '{}' is not numeric, stored as missing", raw),
                ));
                Cell::Missing
            }
        }
    }
}

/// Parse a numeric cell. `None` means the text is neither a number nor a
/// missing marker.
pub fn parse_reading(raw: &str) -> Option<Cell> {
    let raw = raw.trim();
    if is_missing(raw) {
        return Some(Cell::Missing);
    }
    let value = raw
        .parse::<f64>()
        .or_else(|_| raw.replace([',', ' '], "").parse::<f64>())
        .ok()?;
    if value.is_finite() {
        Some(Cell::Value(value))
    } else {
        None
    }
}

fn is_missing(raw: &str) -> bool {
    let upper = raw.trim().to_ascii_uppercase();
    MISSING_TOKENS.contains(&upper.as_str())
}

/// `SUBJECT_SAMPLE_FACTORS:  \tSUBJECT...` -> `SUBJECT_SAMPLE_FACTORS`.
fn section_name(rest: &str) -> String {
    rest.split(|c: char| c == ':' || c.is_whitespace())
        .next()
        .unwrap_or("")
        .trim()
        .to_string()
}

/// Split `KEY<tab or spaces>value`.
fn split_key_value(line: &str) -> (&str, &str) {
    let line = line.trim();
    match line.find(|c: char| c == '\t' || c.is_whitespace()) {
        Some(pos) => (&line[..pos], line[pos..].trim()),
        None => (line, ""),
    }
}

/// `STUDY_ID:ST000315`, `STUDY_ID\tST000315` or `STUDY_ID ST000315`.
fn standalone_header(line: &str) -> Option<(&'static str, &str)> {
    let line = line.trim();
    STANDALONE_HEADER_KEYS.iter().find_map(|key| {
        let rest = line.strip_prefix(key)?;
        let value = rest
            .strip_prefix(':')
            .or_else(|| rest.starts_with(char::is_whitespace).then_some(rest))?
            .trim();
        Some((*key, value))
    })
}

/// `MS_METABOLITE_DATA:UNITS\tmM` -> (`MS_METABOLITE_DATA`, `mM`).
fn units_line(line: &str) -> Option<(String, String)> {
    let (key, value) = split_key_value(line);
    let (table, rest) = key.split_once(":UNITS")?;
    if table.is_empty() {
        return None;
    }
    let unit = if value.is_empty() {
        rest.trim_start_matches(':').trim()
    } else {
        value
    };
    Some((table.to_string(), unit.to_string()))
}

/// `UNITS<TAB>mM` written as a row of the table it applies to.
fn bare_units(line: &str) -> Option<String> {
    let (key, value) = split_key_value(line);
    (key.eq_ignore_ascii_case("UNITS") && !value.is_empty()).then(|| value.to_string())
}

fn table_start(line: &str) -> Option<String> {
    let line = line.trim();
    if line.contains(char::is_whitespace) {
        return None;
    }
    line.strip_suffix("_START")
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

fn is_table_end(line: &str, name: &str) -> bool {
    line.trim()
        .strip_prefix(name)
        .is_some_and(|rest| rest == "_END")
}

fn is_measurement_table(name: &str) -> bool {
    name.ends_with("_DATA")
}
