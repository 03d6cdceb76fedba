use parking_lot::Mutex;
use std::fmt::Write as _;

/// Value of one runtime-info entry, typed for the report line.
#[derive(Debug, Clone)]
pub enum EntryValue {
    Long(i64),
    Double(f64),
    Str(String),
}

impl EntryValue {
    fn type_name(&self) -> &'static str {
        match self {
            EntryValue::Long(_) => "long",
            EntryValue::Double(_) => "double",
            EntryValue::Str(_) => "string",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    value: EntryValue,
    units: String,
    description: String,
}

/// Registry of runtime-info entries, printed as tab-separated lines when
/// the `DISTRUN_REPORT_PREFIX` environment variable is set:
/// `[prefix\t]type\tname\tvalue\tunits\tdescription`.
#[derive(Debug, Default)]
pub struct RuntimeInfo {
    entries: Mutex<Vec<Entry>>,
}

impl RuntimeInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_string(
        &self,
        name: impl Into<String>,
        value: impl Into<String>,
        description: impl Into<String>,
    ) {
        self.add(name, EntryValue::Str(value.into()), "", description);
    }

    pub fn add_long(
        &self,
        name: impl Into<String>,
        value: i64,
        units: impl Into<String>,
        description: impl Into<String>,
    ) {
        self.add(name, EntryValue::Long(value), units, description);
    }

    pub fn add(
        &self,
        name: impl Into<String>,
        value: EntryValue,
        units: impl Into<String>,
        description: impl Into<String>,
    ) {
        self.entries.lock().push(Entry {
            name: name.into(),
            value,
            units: units.into(),
            description: description.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Emit the report to stdout if `DISTRUN_REPORT_PREFIX` is set. An
    /// empty value is allowed and prints without the prefix column.
    pub fn maybe_print_report(&self) {
        let Ok(prefix) = std::env::var("DISTRUN_REPORT_PREFIX") else {
            return;
        };
        print!("{}", self.render(&prefix));
    }

    fn render(&self, prefix: &str) -> String {
        let mut out = String::new();
        for entry in self.entries.lock().iter() {
            if !prefix.is_empty() {
                let _ = write!(out, "{prefix}\t");
            }
            let _ = write!(out, "{}\t{}\t", entry.value.type_name(), entry.name);
            match &entry.value {
                EntryValue::Long(v) => {
                    let _ = write!(out, "{v}");
                }
                EntryValue::Double(v) => {
                    let _ = write!(out, "{v}");
                }
                EntryValue::Str(v) => {
                    let _ = write!(out, "{v}");
                }
            }
            let _ = writeln!(out, "\t{}\t{}", entry.units, entry.description);
        }
        out
    }
}
