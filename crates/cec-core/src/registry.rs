//! Per-category canonical schemas and the raw-column variant map.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{CanonicalRecord, EquipmentCategory, FieldType, FieldValue, NaturalKey};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("equipment category {0} is not registered")]
    NotRegistered(EquipmentCategory),
    #[error("equipment category {0} is registered twice")]
    DuplicateCategory(EquipmentCategory),
    #[error("{category}: canonical field {field} is declared twice")]
    DuplicateField {
        category: EquipmentCategory,
        field: String,
    },
    #[error("{0}: natural key is empty")]
    EmptyNaturalKey(EquipmentCategory),
    #[error("{category}: natural-key field {field} is not a required field")]
    KeyFieldNotRequired {
        category: EquipmentCategory,
        field: String,
    },
    #[error("{category}: column variant {variant:?} maps to both {first} and {second}")]
    AmbiguousVariant {
        category: EquipmentCategory,
        variant: String,
        first: String,
        second: String,
    },
}

/// One canonical field of a category schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
    pub required: bool,
    /// Raw header spellings observed across spreadsheet vintages.
    pub variants: &'static [&'static str],
}

impl FieldSpec {
    pub const fn required(
        name: &'static str,
        field_type: FieldType,
        variants: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            field_type,
            required: true,
            variants,
        }
    }

    pub const fn optional(
        name: &'static str,
        field_type: FieldType,
        variants: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            field_type,
            required: false,
            variants,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CategorySchema {
    category: EquipmentCategory,
    table_name: &'static str,
    fields: Vec<FieldSpec>,
    natural_key: Vec<&'static str>,
    variant_index: HashMap<String, usize>,
}

impl CategorySchema {
    pub fn new(
        category: EquipmentCategory,
        table_name: &'static str,
        fields: Vec<FieldSpec>,
        natural_key: Vec<&'static str>,
    ) -> Result<Self, RegistryError> {
        let mut variant_index: HashMap<String, usize> = HashMap::new();
        for (idx, field) in fields.iter().enumerate() {
            if fields[..idx].iter().any(|f| f.name == field.name) {
                return Err(RegistryError::DuplicateField {
                    category,
                    field: field.name.to_string(),
                });
            }
            let spellings = std::iter::once(field.name).chain(field.variants.iter().copied());
            for spelling in spellings {
                let normalized = normalize_header(spelling);
                match variant_index.get(&normalized) {
                    Some(&existing) if existing != idx => {
                        return Err(RegistryError::AmbiguousVariant {
                            category,
                            variant: spelling.to_string(),
                            first: fields[existing].name.to_string(),
                            second: field.name.to_string(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        variant_index.insert(normalized, idx);
                    }
                }
            }
        }

        if natural_key.is_empty() {
            return Err(RegistryError::EmptyNaturalKey(category));
        }
        for key_field in &natural_key {
            let required = fields
                .iter()
                .any(|f| f.name == *key_field && f.required);
            if !required {
                return Err(RegistryError::KeyFieldNotRequired {
                    category,
                    field: key_field.to_string(),
                });
            }
        }

        Ok(Self {
            category,
            table_name,
            fields,
            natural_key,
            variant_index,
        })
    }

    pub fn category(&self) -> EquipmentCategory {
        self.category
    }

    /// Store table backing this category's namespace.
    pub fn table_name(&self) -> &'static str {
        self.table_name
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.required)
    }

    pub fn natural_key_fields(&self) -> &[&'static str] {
        &self.natural_key
    }

    /// Map a raw spreadsheet header onto its canonical field, tolerating case,
    /// whitespace, punctuation and unit-suffix drift.
    pub fn resolve_column(&self, raw_header: &str) -> Option<&FieldSpec> {
        let normalized = normalize_header(raw_header);
        if normalized.is_empty() {
            return None;
        }
        self.variant_index
            .get(&normalized)
            .map(|&idx| &self.fields[idx])
    }

    /// Natural key of a record, or the first key field that is Unknown.
    pub fn natural_key(&self, record: &CanonicalRecord) -> Result<NaturalKey, &'static str> {
        let mut parts = Vec::with_capacity(self.natural_key.len());
        for field in &self.natural_key {
            let value = record.get(field);
            if value.is_unknown() {
                return Err(*field);
            }
            parts.push(value.to_string());
        }
        Ok(NaturalKey::from_parts(parts))
    }

    /// SHA-256 over the known canonical attributes in schema order.
    ///
    /// Unknown values are left out, so adding an optional field to a schema
    /// does not change the hash of records that never carry it.
    pub fn content_hash(&self, attributes: &BTreeMap<String, FieldValue>) -> String {
        let mut hasher = Sha256::new();
        for field in &self.fields {
            let Some(value) = attributes.get(field.name).filter(|v| !v.is_unknown()) else {
                continue;
            };
            let repr = value.hash_repr();
            hasher.update(field.name.as_bytes());
            hasher.update(b"\x1f");
            hasher.update(field.field_type.tag().as_bytes());
            hasher.update(b"\x1f");
            hasher.update(repr.as_bytes());
            hasher.update(b"\x1e");
        }
        hex::encode(hasher.finalize())
    }
}

/// Lowercase, strip trailing `(unit)`/`[unit]` suffixes and collapse every run
/// of non-alphanumeric characters to a single space.
pub fn normalize_header(raw: &str) -> String {
    let stem = strip_unit_suffix(raw.trim());
    let mut out = String::with_capacity(stem.len());
    let mut pending_space = false;
    for ch in stem.chars() {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    out
}

fn strip_unit_suffix(header: &str) -> &str {
    let mut current = header.trim_end();
    loop {
        let open = match current.chars().last() {
            Some(')') => '(',
            Some(']') => '[',
            _ => break,
        };
        match current.rfind(open) {
            Some(idx) if idx > 0 => current = current[..idx].trim_end(),
            _ => break,
        }
    }
    current
}

#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    schemas: BTreeMap<EquipmentCategory, CategorySchema>,
}

impl SchemaRegistry {
    pub fn from_schemas(schemas: Vec<CategorySchema>) -> Result<Self, RegistryError> {
        let mut map = BTreeMap::new();
        for schema in schemas {
            let category = schema.category;
            if map.insert(category, schema).is_some() {
                return Err(RegistryError::DuplicateCategory(category));
            }
        }
        Ok(Self { schemas: map })
    }

    /// Schemas for every category the regulator publishes.
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::from_schemas(vec![
            modules_schema()?,
            inverters_schema()?,
            energy_storage_schema()?,
            batteries_schema()?,
            meters_schema()?,
        ])
    }

    pub fn schema(&self, category: EquipmentCategory) -> Result<&CategorySchema, RegistryError> {
        self.schemas
            .get(&category)
            .ok_or(RegistryError::NotRegistered(category))
    }

    pub fn contains(&self, category: EquipmentCategory) -> bool {
        self.schemas.contains_key(&category)
    }

    pub fn categories(&self) -> impl Iterator<Item = EquipmentCategory> + '_ {
        self.schemas.keys().copied()
    }
}

const MANUFACTURER: FieldSpec = FieldSpec::required(
    "manufacturer",
    FieldType::Text,
    &["Manufacturer", "Manufacturer Name", "Mfr"],
);
const MODEL_NUMBER: FieldSpec = FieldSpec::required(
    "model_number",
    FieldType::Text,
    &["Model Number", "Model Number1", "Model No", "Model"],
);
const DESCRIPTION: FieldSpec =
    FieldSpec::optional("description", FieldType::Text, &["Description"]);
const LAST_UPDATE: FieldSpec = FieldSpec::optional(
    "last_update",
    FieldType::Date,
    &["Last Update", "Last Updated", "Updated"],
);
const CERTIFYING_ENTITY: FieldSpec = FieldSpec::optional(
    "certifying_entity",
    FieldType::Text,
    &["Certifying Entity", "Certification Entity"],
);
const CERTIFICATE_DATE: FieldSpec = FieldSpec::optional(
    "certificate_date",
    FieldType::Date,
    &["Certificate Date", "Certification Date"],
);

const fn listing_date(variants: &'static [&'static str]) -> FieldSpec {
    FieldSpec::required("listing_date", FieldType::Date, variants)
}

fn modules_schema() -> Result<CategorySchema, RegistryError> {
    CategorySchema::new(
        EquipmentCategory::Modules,
        "pv_modules",
        vec![
            MANUFACTURER,
            MODEL_NUMBER,
            DESCRIPTION,
            FieldSpec::optional(
                "safety_certification",
                FieldType::Text,
                &["Safety Certification"],
            ),
            FieldSpec::optional("technology", FieldType::Text, &["Technology", "Cell Technology"]),
            FieldSpec::optional(
                "nameplate_pmax_w",
                FieldType::Number,
                &["Nameplate Pmax", "Pmax", "Rated Power"],
            ),
            FieldSpec::optional("ptc_w", FieldType::Number, &["PTC", "PTC Rating"]),
            FieldSpec::optional("nameplate_isc_a", FieldType::Number, &["Nameplate Isc", "Isc"]),
            FieldSpec::optional("nameplate_voc_v", FieldType::Number, &["Nameplate Voc", "Voc"]),
            FieldSpec::optional(
                "nameplate_ipmax_a",
                FieldType::Number,
                &["Nameplate Ipmax", "Ipmax"],
            ),
            FieldSpec::optional(
                "nameplate_vpmax_v",
                FieldType::Number,
                &["Nameplate Vpmax", "Vpmax"],
            ),
            FieldSpec::optional("average_noct_c", FieldType::Number, &["Average NOCT", "NOCT"]),
            FieldSpec::optional("bipv", FieldType::Boolean, &["BIPV"]),
            listing_date(&["CEC Listing Date", "Listing Date"]),
            LAST_UPDATE,
            FieldSpec::optional("notes", FieldType::Text, &["Notes", "Note"]),
        ],
        vec!["manufacturer", "model_number"],
    )
}

fn inverters_schema() -> Result<CategorySchema, RegistryError> {
    CategorySchema::new(
        EquipmentCategory::Inverters,
        "inverters",
        vec![
            MANUFACTURER,
            MODEL_NUMBER,
            DESCRIPTION,
            FieldSpec::optional(
                "max_continuous_power_kw",
                FieldType::Number,
                &[
                    "Maximum Continuous Output Power at Unity Power Factor",
                    "Maximum Continuous Output Power",
                    "Power Rating",
                ],
            ),
            FieldSpec::optional(
                "nominal_voltage_vac",
                FieldType::Number,
                &["Nominal Voltage", "Voltage"],
            ),
            FieldSpec::optional(
                "weighted_efficiency_pct",
                FieldType::Number,
                &["Weighted Efficiency", "CEC Weighted Efficiency", "CEC Efficiency"],
            ),
            FieldSpec::optional("built_in_meter", FieldType::Boolean, &["Built-In Meter"]),
            FieldSpec::optional("microinverter", FieldType::Boolean, &["Microinverter"]),
            FieldSpec::optional(
                "night_tare_loss_w",
                FieldType::Number,
                &["Night Tare Loss", "Night Tare"],
            ),
            listing_date(&["Grid Support Listing Date", "CEC Listing Date", "Listing Date"]),
            LAST_UPDATE,
            FieldSpec::optional("notes", FieldType::Text, &["Notes", "Note"]),
        ],
        vec!["manufacturer", "model_number"],
    )
}

fn energy_storage_schema() -> Result<CategorySchema, RegistryError> {
    CategorySchema::new(
        EquipmentCategory::EnergyStorage,
        "energy_storage",
        vec![
            MANUFACTURER,
            MODEL_NUMBER,
            FieldSpec::optional("chemistry", FieldType::Text, &["Chemistry", "Technology"]),
            FieldSpec::optional(
                "pv_dc_input",
                FieldType::Boolean,
                &["PV DC Input Capability", "PV DC Input"],
            ),
            CERTIFYING_ENTITY,
            CERTIFICATE_DATE,
            DESCRIPTION,
            FieldSpec::optional(
                "capacity_kwh",
                FieldType::Number,
                &["Nameplate Energy Capacity", "Capacity"],
            ),
            FieldSpec::optional(
                "continuous_power_kw",
                FieldType::Number,
                &["Nameplate Power", "Continuous Power Rating"],
            ),
            FieldSpec::optional(
                "nominal_voltage_vac",
                FieldType::Number,
                &["Nominal Voltage", "Voltage"],
            ),
            FieldSpec::optional(
                "max_discharge_rate_kw",
                FieldType::Number,
                &["Maximum Continuous Discharge Rate", "Maximum Discharge Rate"],
            ),
            listing_date(&["Energy Storage Listing Date", "CEC Listing Date", "Listing Date"]),
            LAST_UPDATE,
        ],
        vec!["manufacturer", "model_number"],
    )
}

fn batteries_schema() -> Result<CategorySchema, RegistryError> {
    CategorySchema::new(
        EquipmentCategory::Batteries,
        "batteries",
        vec![
            MANUFACTURER,
            MODEL_NUMBER,
            FieldSpec::optional("chemistry", FieldType::Text, &["Chemistry", "Technology"]),
            DESCRIPTION,
            CERTIFYING_ENTITY,
            CERTIFICATE_DATE,
            FieldSpec::optional(
                "capacity_kwh",
                FieldType::Number,
                &["Nameplate Energy Capacity", "Capacity"],
            ),
            FieldSpec::optional(
                "discharge_rate_kw",
                FieldType::Number,
                &["Discharge Rate", "Maximum Continuous Discharge Rate"],
            ),
            FieldSpec::optional(
                "round_trip_efficiency_pct",
                FieldType::Number,
                &[
                    "Manufacturers Declared Roundtrip Efficiency",
                    "Round Trip Efficiency",
                    "Roundtrip Efficiency",
                ],
            ),
            listing_date(&["Battery Listing Date", "CEC Listing Date", "Listing Date"]),
            LAST_UPDATE,
        ],
        vec!["manufacturer", "model_number"],
    )
}

fn meters_schema() -> Result<CategorySchema, RegistryError> {
    CategorySchema::new(
        EquipmentCategory::Meters,
        "meters",
        vec![
            MANUFACTURER,
            MODEL_NUMBER,
            FieldSpec::optional("display_type", FieldType::Text, &["Display Type", "Display"]),
            FieldSpec::optional("pbi_meter", FieldType::Boolean, &["PBI Meter", "PBI"]),
            FieldSpec::optional("note", FieldType::Text, &["Note", "Notes"]),
            listing_date(&["Meter Listing Date", "CEC Listing Date", "Listing Date"]),
            LAST_UPDATE,
        ],
        vec!["manufacturer", "model_number"],
    )
}
