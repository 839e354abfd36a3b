//! Derived candidate kinematics.
//!
//! [`annotate`] adds momentum components, decay length, ct, pointing angle
//! and the two invariant-mass hypotheses to a candidate table. Optional raw
//! columns are inspected once ([`Capabilities::detect`]) and the chosen
//! calibration path is returned to the caller.

use hs_core::{Error, Result};
use hs_data::{Expr, TabularDataset};
use serde::{Deserialize, Serialize};

/// ³He mass in GeV/c².
pub const HE3_MASS: f64 = 2.80839160743;
/// ⁴He mass in GeV/c².
pub const HE4_MASS: f64 = 3.72737937823;
/// Charged pion mass in GeV/c².
pub const PION_MASS: f64 = 0.13957039;
/// ct constant for the ³ΛH hypothesis.
pub const H3L_CT_MASS: f64 = 2.99131;
/// ct constant for the ⁴ΛH hypothesis.
pub const H4L_CT_MASS: f64 = 3.9226;

/// PID hypothesis code of tracks reconstructed as tritons.
const TRITON_HYPOTHESIS: u32 = 6;

/// Raw columns every candidate table must provide.
pub const REQUIRED_COLUMNS: &[&str] = &[
    "fPtHe3", "fEtaHe3", "fPhiHe3", "fPtPi", "fEtaPi", "fPhiPi", "fXDecVtx", "fYDecVtx", "fZDecVtx",
];

/// Additional raw columns of simulated tables.
pub const REQUIRED_MC_COLUMNS: &[&str] =
    &["fGenPt", "fGenEta", "fGenXDecVtx", "fGenYDecVtx", "fGenZDecVtx"];

/// Empirical helium momentum correction `pT' = pT + a + b·exp(-c·pT)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Constant shift
    pub a: f64,
    /// Amplitude of the exponential term
    pub b: f64,
    /// Slope of the exponential term
    pub c: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self { a: 2.98019e-2, b: 7.66100e-1, c: 1.31641 }
    }
}

impl Calibration {
    /// Corrected momentum.
    pub fn apply(&self, pt: f64) -> f64 {
        pt + self.a + self.b * (-self.c * pt).exp()
    }
}

/// Optional inputs present in a candidate table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// `fHePIDHypo` is available (directly or via `fFlags`)
    pub pid_hypothesis: bool,
    /// Packed `fFlags` column present
    pub pid_flags: bool,
    /// `fXPrimVtx`, `fYPrimVtx`, `fZPrimVtx` present
    pub primary_vertex: bool,
}

impl Capabilities {
    /// Inspect the columns of `ds`.
    pub fn detect(ds: &TabularDataset) -> Self {
        let pid_flags = ds.has_column("fFlags");
        Self {
            pid_hypothesis: pid_flags || ds.has_column("fHePIDHypo"),
            pid_flags,
            primary_vertex: ["fXPrimVtx", "fYPrimVtx", "fZPrimVtx"].iter().all(|c| ds.has_column(c)),
        }
    }
}

/// Options of [`annotate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotateOptions {
    /// Apply the helium momentum calibration
    pub calibrate_momentum: bool,
    /// Also derive generated-level columns
    pub is_mc: bool,
    /// Use the ⁴ΛH constant for ct
    pub alt_mass_hypothesis: bool,
    /// Calibration constants
    pub calibration: Calibration,
}

/// Add derived kinematic columns to `ds` in place.
///
/// Missing required columns fail with [`Error::InvalidExpression`].
pub fn annotate(ds: &mut TabularDataset, options: &AnnotateOptions) -> Result<Capabilities> {
    let caps = Capabilities::detect(ds);

    if caps.pid_flags {
        let flags = ds.column("fFlags")?;
        let (he, pi): (Vec<f64>, Vec<f64>) = flags
            .iter()
            .map(|&f| {
                let bits = f as u32;
                ((bits >> 4) as f64, (bits & 0xF) as f64)
            })
            .unzip();
        ds.set_column("fHePIDHypo", he)?;
        ds.set_column("fPiPIDHypo", pi)?;
    }

    if options.calibrate_momentum {
        calibrate(ds, &options.calibration, caps)?;
    }

    let ct_mass = if options.alt_mass_hypothesis { H4L_CT_MASS } else { H3L_CT_MASS };
    for (name, formula) in daughter_formulas() {
        ds.derive_str(&name, &formula)?;
    }

    let (dx, dy, dz) = if caps.primary_vertex {
        ("(fXDecVtx - fXPrimVtx)", "(fYDecVtx - fYPrimVtx)", "(fZDecVtx - fZPrimVtx)")
    } else {
        ("fXDecVtx", "fYDecVtx", "fZDecVtx")
    };
    let candidate = [
        ("fPx", "fPxHe3 + fPxPi".to_string()),
        ("fPy", "fPyHe3 + fPyPi".to_string()),
        ("fPz", "fPzHe3 + fPzPi".to_string()),
        ("fP", "sqrt(fPx**2 + fPy**2 + fPz**2)".to_string()),
        ("fPt", "sqrt(fPx**2 + fPy**2)".to_string()),
        ("fEn", "fEnHe3 + fEnPi".to_string()),
        ("fEn4", "fEnHe4 + fEnPi".to_string()),
        ("fDecLen", format!("sqrt({dx}**2 + {dy}**2 + {dz}**2)")),
        ("fDecRad", format!("sqrt({dx}**2 + {dy}**2)")),
        ("fCt", format!("fDecLen * {ct_mass} / fP")),
        ("fCosPA", format!("(fPx * {dx} + fPy * {dy} + fPz * {dz}) / (fP * fDecLen)")),
        ("fMassH3L", "sqrt(max(fEn**2 - fP**2, 0))".to_string()),
        ("fMassH4L", "sqrt(max(fEn4**2 - fP**2, 0))".to_string()),
    ];
    for (name, formula) in &candidate {
        ds.derive_str(name, formula)?;
    }
    // A candidate at the primary vertex or with no momentum points back by definition.
    let cos_pa: Vec<f64> = ds
        .column("fCosPA")?
        .iter()
        .zip(ds.column("fP")?.iter().zip(ds.column("fDecLen")?))
        .map(|(&c, (&p, &l))| if p * l == 0.0 { 1.0 } else { c })
        .collect();
    ds.set_column("fCosPA", cos_pa)?;

    if options.is_mc {
        let generated = [
            ("fGenDecLen", "sqrt(fGenXDecVtx**2 + fGenYDecVtx**2 + fGenZDecVtx**2)".to_string()),
            ("fAbsGenPt", "abs(fGenPt)".to_string()),
            ("fGenPz", "fAbsGenPt * sinh(fGenEta)".to_string()),
            ("fGenP", "sqrt(fAbsGenPt**2 + fGenPz**2)".to_string()),
            ("fGenCt", format!("fGenDecLen * {ct_mass} / fGenP")),
        ];
        for (name, formula) in &generated {
            ds.derive_str(name, formula)?;
        }
    }

    log::debug!(
        "annotated {} candidates (pid hypothesis: {}, primary vertex: {}, mc: {})",
        ds.count(),
        caps.pid_hypothesis,
        caps.primary_vertex,
        options.is_mc
    );
    Ok(caps)
}

fn daughter_formulas() -> Vec<(String, String)> {
    let he3: &[(&str, f64)] = &[("fEnHe3", HE3_MASS), ("fEnHe4", HE4_MASS)];
    let pi: &[(&str, f64)] = &[("fEnPi", PION_MASS)];
    let mut out = Vec::new();
    for (d, masses) in [("He3", he3), ("Pi", pi)] {
        out.push((format!("fPx{d}"), format!("fPt{d} * cos(fPhi{d})")));
        out.push((format!("fPy{d}"), format!("fPt{d} * sin(fPhi{d})")));
        out.push((format!("fPz{d}"), format!("fPt{d} * sinh(fEta{d})")));
        out.push((format!("fP{d}"), format!("fPt{d} * cosh(fEta{d})")));
        for &(name, m) in masses {
            out.push((name.to_string(), format!("sqrt(fP{d}**2 + {m}**2)")));
        }
    }
    out
}

fn calibrate(ds: &mut TabularDataset, cal: &Calibration, caps: Capabilities) -> Result<()> {
    let pt = ds.column("fPtHe3")?;
    let corrected: Vec<f64> = if caps.pid_hypothesis {
        let hypo = ds.column("fHePIDHypo")?;
        pt.iter()
            .zip(hypo)
            .map(|(&p, &h)| if h as u32 == TRITON_HYPOTHESIS { cal.apply(p) } else { p })
            .collect()
    } else {
        log::info!("no PID hypothesis column, calibrating every helium track");
        pt.iter().map(|&p| cal.apply(p)).collect()
    };
    ds.set_column("fPtHe3", corrected)
}

/// Charge-conjugate sample selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatterSelection {
    /// Particles only
    Matter,
    /// Antiparticles only
    Antimatter,
    /// Union of both
    #[default]
    Both,
}

impl MatterSelection {
    /// Predicate on reconstructed candidates (`fIsMatter`), `None` for both.
    pub fn data_predicate(self) -> Option<Expr> {
        match self {
            MatterSelection::Matter => Some(Expr::col("fIsMatter").equals(1.0)),
            MatterSelection::Antimatter => Some(Expr::col("fIsMatter").equals(0.0)),
            MatterSelection::Both => None,
        }
    }

    /// Predicate on simulated candidates (sign of `fGenPt`), `None` for both.
    pub fn mc_predicate(self) -> Option<Expr> {
        match self {
            MatterSelection::Matter => Some(Expr::col("fGenPt").gt(0.0)),
            MatterSelection::Antimatter => Some(Expr::col("fGenPt").lt(0.0)),
            MatterSelection::Both => None,
        }
    }
}

impl std::str::FromStr for MatterSelection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "matter" => Ok(MatterSelection::Matter),
            "antimatter" => Ok(MatterSelection::Antimatter),
            "both" => Ok(MatterSelection::Both),
            other => Err(Error::Config(format!(
                "invalid matter option '{other}' (expected matter, antimatter or both)"
            ))),
        }
    }
}
