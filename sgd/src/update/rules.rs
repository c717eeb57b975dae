use serde::{Deserialize, Serialize};

use crate::{Result, SgdErr};

/// How the smoothed gradient state rescales the raw gradient.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradientUpdateType {
    /// Plain momentum SGD.
    #[default]
    None,
    AdaGrad,
    RmsProp,
    FsAdaGrad,
}

/// RMSProp hyper-parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RmsPropSettings {
    pub gamma: f64,
    pub inc: f64,
    pub dec: f64,
    pub max: f64,
    pub min: f64,
}

impl Default for RmsPropSettings {
    fn default() -> Self {
        Self {
            gamma: 0.99,
            inc: 1.2,
            dec: 0.75,
            max: 10.,
            min: 0.1,
        }
    }
}

/// FSAdaGrad hyper-parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsAdaGradSettings {
    pub target_ada_grad_av_denom: f64,
    /// In samples.
    pub variance_time_constant: f64,
}

impl Default for FsAdaGradSettings {
    fn default() -> Self {
        Self {
            target_ada_grad_av_denom: 1.,
            variance_time_constant: 2. * 3600. * 100.,
        }
    }
}

/// The update rule and its hyper-parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradientUpdateConfig {
    #[serde(rename = "type")]
    pub kind: GradientUpdateType,
    pub rms_prop: RmsPropSettings,
    pub fs_ada_grad: FsAdaGradSettings,
}

impl GradientUpdateConfig {
    /// Returns the length of the smoothed state kept for a parameter of `n` elements.
    pub fn state_len(&self, n: usize) -> usize {
        match self.kind {
            GradientUpdateType::None | GradientUpdateType::AdaGrad => n,
            GradientUpdateType::RmsProp => 3 * n,
            GradientUpdateType::FsAdaGrad => 2 * n,
        }
    }

    /// Checks the hyper-parameters of the selected rule.
    pub fn validate(&self) -> Result<()> {
        let ok = match self.kind {
            GradientUpdateType::None | GradientUpdateType::AdaGrad => true,
            GradientUpdateType::RmsProp => {
                let r = &self.rms_prop;
                (0. ..1.).contains(&r.gamma)
                    && r.inc >= 1.
                    && r.dec > 0.
                    && r.dec <= 1.
                    && r.min > 0.
                    && r.max >= r.min
            }
            GradientUpdateType::FsAdaGrad => {
                let f = &self.fs_ada_grad;
                f.variance_time_constant > 0. && f.target_ada_grad_av_denom > 0.
            }
        };

        if !ok {
            return Err(SgdErr::InvalidConfig(format!(
                "invalid hyper-parameters for the {:?} update rule",
                self.kind
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_sizes_per_rule() {
        let mut cfg = GradientUpdateConfig::default();
        assert_eq!(cfg.state_len(5), 5);
        cfg.kind = GradientUpdateType::RmsProp;
        assert_eq!(cfg.state_len(5), 15);
        cfg.kind = GradientUpdateType::FsAdaGrad;
        assert_eq!(cfg.state_len(5), 10);
    }

    #[test]
    fn rule_parses_from_json() {
        let cfg: GradientUpdateConfig =
            serde_json::from_str(r#"{ "type": "rms_prop", "rms_prop": { "gamma": 0.9 } }"#).unwrap();
        assert_eq!(cfg.kind, GradientUpdateType::RmsProp);
        assert_eq!(cfg.rms_prop.gamma, 0.9);
        assert_eq!(cfg.rms_prop.max, 10.);
        cfg.validate().unwrap();
    }

    #[test]
    fn bad_rms_settings_are_rejected() {
        let cfg = GradientUpdateConfig {
            kind: GradientUpdateType::RmsProp,
            rms_prop: RmsPropSettings {
                min: 2.,
                max: 1.,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
