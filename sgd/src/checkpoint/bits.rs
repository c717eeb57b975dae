//! Serde adapters storing `f64` values as their raw bits, so NaN and infinities
//! round-trip through JSON and no decimal conversion ever loses precision.

pub mod exact {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.to_bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        u64::deserialize(d).map(f64::from_bits)
    }
}

pub mod exact_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<f64>, s: S) -> Result<S::Ok, S::Error> {
        value.map(f64::to_bits).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(f64::from_bits))
    }
}

pub mod exact_vec {
    use serde::{Deserialize, Deserializer, Serializer, ser::SerializeSeq};

    pub fn serialize<S: Serializer>(values: &[f64], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(values.len()))?;
        for v in values {
            seq.serialize_element(&v.to_bits())?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f64>, D::Error> {
        Ok(Vec::<u64>::deserialize(d)?
            .into_iter()
            .map(f64::from_bits)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Values {
        #[serde(with = "super::exact")]
        a: f64,
        #[serde(with = "super::exact_opt")]
        b: Option<f64>,
        #[serde(with = "super::exact_vec")]
        c: Vec<f64>,
    }

    #[test]
    fn special_values_survive_json() {
        let v = Values {
            a: f64::NAN,
            b: Some(f64::MAX),
            c: vec![0.1, f64::NEG_INFINITY],
        };

        let json = serde_json::to_string(&v).unwrap();
        let back: Values = serde_json::from_str(&json).unwrap();

        assert!(back.a.is_nan());
        assert_eq!(back.b, Some(f64::MAX));
        assert_eq!(back.c, [0.1, f64::NEG_INFINITY]);
    }
}
