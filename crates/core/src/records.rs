use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::{Map, Number, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn key(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

/// Storage and aggregation key. Each side of the actuator is its own
/// category so both can land in the same cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    AggregateStatus,
    Actuator(Side),
    Sensor,
}

pub const AGGREGATE_STATUS_KEY: &str = "aggregate-status";
pub const ACTUATOR_KEY: &str = "actuator";
pub const SENSOR_KEY: &str = "sensor";

const AGGREGATE_STATUS_FIELDS: &[&str] =
    &["voltage", "current", "power", "temperature", "state_of_charge"];
const ACTUATOR_FIELDS: &[&str] = &["rpm", "torque", "current", "voltage", "temperature"];
const SENSOR_FIELDS: &[&str] = &["accel_x", "accel_y", "accel_z", "gyro_x", "gyro_y", "gyro_z"];

impl Category {
    /// Replay order.
    pub const ALL: [Category; 4] = [
        Category::AggregateStatus,
        Category::Actuator(Side::Left),
        Category::Actuator(Side::Right),
        Category::Sensor,
    ];

    pub fn fields(self) -> &'static [&'static str] {
        match self {
            Category::AggregateStatus => AGGREGATE_STATUS_FIELDS,
            Category::Actuator(_) => ACTUATOR_FIELDS,
            Category::Sensor => SENSOR_FIELDS,
        }
    }

    pub fn table_name(self) -> &'static str {
        match self {
            Category::AggregateStatus => "aggregate_status",
            Category::Actuator(Side::Left) => "actuator_left",
            Category::Actuator(Side::Right) => "actuator_right",
            Category::Sensor => "sensor_bundle",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Category::AggregateStatus => AGGREGATE_STATUS_KEY,
            Category::Actuator(Side::Left) => "actuator.left",
            Category::Actuator(Side::Right) => "actuator.right",
            Category::Sensor => SENSOR_KEY,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateStatus {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub temperature: f64,
    pub state_of_charge: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActuatorSample {
    pub rpm: f64,
    pub torque: f64,
    pub current: f64,
    pub voltage: f64,
    pub temperature: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorBundle {
    pub accel_x: f64,
    pub accel_y: f64,
    pub accel_z: f64,
    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,
}

/// One schema-validated fragment of an envelope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SubRecord {
    AggregateStatus(AggregateStatus),
    Actuator { side: Side, sample: ActuatorSample },
    SensorBundle(SensorBundle),
}

impl SubRecord {
    pub fn category(&self) -> Category {
        match self {
            SubRecord::AggregateStatus(_) => Category::AggregateStatus,
            SubRecord::Actuator { side, .. } => Category::Actuator(*side),
            SubRecord::SensorBundle(_) => Category::Sensor,
        }
    }

    /// Field values in `Category::fields` order.
    pub fn values(&self) -> Vec<f64> {
        match self {
            SubRecord::AggregateStatus(s) => {
                vec![s.voltage, s.current, s.power, s.temperature, s.state_of_charge]
            }
            SubRecord::Actuator { sample: a, .. } => {
                vec![a.rpm, a.torque, a.current, a.voltage, a.temperature]
            }
            SubRecord::SensorBundle(b) => {
                vec![b.accel_x, b.accel_y, b.accel_z, b.gyro_x, b.gyro_y, b.gyro_z]
            }
        }
    }

    /// Inverse of `values`. Returns `None` when the slice length does not
    /// match the category schema.
    pub fn from_values(category: Category, values: &[f64]) -> Option<SubRecord> {
        if values.len() != category.fields().len() {
            return None;
        }
        let record = match category {
            Category::AggregateStatus => SubRecord::AggregateStatus(AggregateStatus {
                voltage: values[0],
                current: values[1],
                power: values[2],
                temperature: values[3],
                state_of_charge: values[4],
            }),
            Category::Actuator(side) => SubRecord::Actuator {
                side,
                sample: ActuatorSample {
                    rpm: values[0],
                    torque: values[1],
                    current: values[2],
                    voltage: values[3],
                    temperature: values[4],
                },
            },
            Category::Sensor => SubRecord::SensorBundle(SensorBundle {
                accel_x: values[0],
                accel_y: values[1],
                accel_z: values[2],
                gyro_x: values[3],
                gyro_y: values[4],
                gyro_z: values[5],
            }),
        };
        Some(record)
    }
}

/// A sub-record after a successful store write.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub record: SubRecord,
}

impl PersistedRecord {
    pub fn category(&self) -> Category {
        self.record.category()
    }

    /// `{"id": .., "created_at": .., <fields>..}`
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".into(), Value::from(self.id));
        obj.insert(
            "created_at".into(),
            Value::String(self.created_at.to_rfc3339()),
        );
        let category = self.category();
        for (field, value) in category.fields().iter().zip(self.record.values()) {
            // Non-finite values cannot be represented in JSON.
            let number = Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null);
            obj.insert((*field).to_string(), number);
        }
        Value::Object(obj)
    }
}

impl Serialize for PersistedRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn values_round_trip_through_schema_order() {
        let rec = SubRecord::Actuator {
            side: Side::Right,
            sample: ActuatorSample {
                rpm: 1200.0,
                torque: 3.5,
                current: 10.0,
                voltage: 48.0,
                temperature: 41.0,
            },
        };
        let values = rec.values();
        assert_eq!(values.len(), Category::Actuator(Side::Right).fields().len());
        assert_eq!(SubRecord::from_values(rec.category(), &values), Some(rec));
    }

    #[test]
    fn from_values_rejects_wrong_arity() {
        assert_eq!(SubRecord::from_values(Category::Sensor, &[1.0, 2.0]), None);
    }

    #[test]
    fn persisted_record_json_flattens_fields() {
        let created_at = Utc.with_ymd_and_hms(2024, 5, 1, 7, 0, 0).unwrap();
        let rec = PersistedRecord {
            id: 7,
            created_at,
            record: SubRecord::AggregateStatus(AggregateStatus {
                voltage: 48.1,
                current: 2.0,
                power: 96.2,
                temperature: 30.0,
                state_of_charge: 0.8,
            }),
        };
        let json = rec.to_json();
        assert_eq!(json["id"], 7);
        assert_eq!(json["created_at"], "2024-05-01T07:00:00+00:00");
        assert_eq!(json["state_of_charge"], 0.8);
        assert_eq!(json.as_object().map(|o| o.len()), Some(7));
    }
}
