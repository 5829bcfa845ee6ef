use crate::{error::LbrError, log::LogLevel::*};
use raw_cpuid::CpuId;
use serde::Serialize;

/// LBR capacity is only tabulated for the P6 lineage.
pub const INTEL_FAMILY_6: u32 = 6;

#[derive(Copy, Clone, Debug)]
struct CpuLbrMap {
    model: u32,
    lbr_capacity: usize,
}

const fn m(model: u32, lbr_capacity: usize) -> CpuLbrMap {
    CpuLbrMap {
        model,
        lbr_capacity,
    }
}

/// Number of LBR from/to pairs per DisplayModel of family 6.
/// See Intel SDM Vol. 3B, "Last Branch, Call Stack, Interrupt, and Exception
/// Recording".
const CPU_LBR_MAPS: [CpuLbrMap; 58] = [
    // Skylake and later cores, Goldmont and later atoms
    m(0x4e, 32),
    m(0x5e, 32),
    m(0x55, 32),
    m(0x66, 32),
    m(0x6a, 32),
    m(0x6c, 32),
    m(0x7d, 32),
    m(0x7e, 32),
    m(0x8c, 32),
    m(0x8d, 32),
    m(0x8e, 32),
    m(0x9e, 32),
    m(0xa5, 32),
    m(0xa6, 32),
    m(0xa7, 32),
    m(0xa8, 32),
    m(0x5c, 32),
    m(0x5f, 32),
    m(0x7a, 32),
    m(0x86, 32),
    m(0x8a, 32),
    m(0x96, 32),
    m(0x9c, 32),
    m(0x97, 32),
    m(0x9a, 32),
    // Nehalem through Broadwell
    m(0x1a, 16),
    m(0x1e, 16),
    m(0x1f, 16),
    m(0x2e, 16),
    m(0x25, 16),
    m(0x2c, 16),
    m(0x2f, 16),
    m(0x2a, 16),
    m(0x2d, 16),
    m(0x3a, 16),
    m(0x3e, 16),
    m(0x3c, 16),
    m(0x45, 16),
    m(0x46, 16),
    m(0x3f, 16),
    m(0x3d, 16),
    m(0x47, 16),
    m(0x4f, 16),
    m(0x56, 16),
    // Bonnell, Silvermont, Airmont
    m(0x1c, 8),
    m(0x26, 8),
    m(0x27, 8),
    m(0x35, 8),
    m(0x36, 8),
    m(0x37, 8),
    m(0x4a, 8),
    m(0x4c, 8),
    m(0x4d, 8),
    m(0x5a, 8),
    m(0x5d, 8),
    // Core 2
    m(0x0f, 4),
    m(0x17, 4),
    m(0x1d, 4),
];

/// What CPUID leaf 1 told us, already folded into display family/model.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CpuSignature {
    pub family: u32,
    pub model: u32,
}

impl CpuSignature {
    /// Decode CPUID.1:EAX.
    pub fn from_eax(eax: u32) -> CpuSignature {
        let family = (eax >> 8) & 0xf;
        let model = (eax >> 4) & 0xf;
        let ext_model = (eax >> 16) & 0xf;
        CpuSignature {
            family,
            model: (ext_model << 4) + model,
        }
    }

    pub fn current() -> Option<CpuSignature> {
        // Leaf 1 does not exist on very old parts.
        CpuId::new().get_feature_info()?;
        Some(CpuSignature::from_eax(cpuid!(1).eax))
    }
}

/// Vendor string, e.g. "GenuineIntel".
pub fn vendor() -> Option<String> {
    CpuId::new()
        .get_vendor_info()
        .map(|v| v.as_string().to_owned())
}

pub fn lbr_capacity_for(sig: CpuSignature) -> Result<usize, LbrError> {
    let unsupported = LbrError::UnsupportedCpu {
        family: sig.family,
        model: sig.model,
    };
    if sig.family != INTEL_FAMILY_6 {
        return Err(unsupported);
    }

    CPU_LBR_MAPS
        .iter()
        .find(|map| map.model == sig.model)
        .map(|map| map.lbr_capacity)
        .ok_or(unsupported)
}

/// Works out the LBR capacity of the cpu we are running on. `forced_model`
/// replaces the model CPUID reports.
pub fn identify_capacity(forced_model: Option<u32>) -> Result<usize, LbrError> {
    let mut sig = match CpuSignature::current() {
        Some(sig) => sig,
        None => {
            return Err(LbrError::UnsupportedCpu {
                family: 0,
                model: 0,
            })
        }
    };
    if let Some(model) = forced_model {
        log!(
            LogInfo,
            "Forcing cpu model {:#x} (cpuid says {:#x})",
            model,
            sig.model
        );
        sig.model = model;
    }

    let capacity = lbr_capacity_for(sig)?;
    log!(
        LogInfo,
        "DisplayFamily_DisplayModel - {:x}_{:x}H, {} LBR entries",
        sig.family,
        sig.model,
        capacity
    );
    Ok(capacity)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signature_from_eax() {
        // Kaby Lake: family 6, model 0x9e, stepping 9.
        let sig = CpuSignature::from_eax(0x000906e9);
        assert_eq!(CpuSignature { family: 6, model: 0x9e }, sig);
        // Nehalem-EP.
        assert_eq!(0x1a, CpuSignature::from_eax(0x000106a5).model);
    }

    #[test]
    fn known_models() {
        let cap = |model| lbr_capacity_for(CpuSignature { family: 6, model });
        assert_eq!(32, cap(0x9e).unwrap());
        assert_eq!(16, cap(0x3c).unwrap());
        assert_eq!(8, cap(0x37).unwrap());
        assert_eq!(4, cap(0x17).unwrap());
    }

    #[test]
    fn unknown_model_is_unsupported() {
        match lbr_capacity_for(CpuSignature {
            family: 6,
            model: 0x01,
        }) {
            Err(LbrError::UnsupportedCpu { family: 6, model: 1 }) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn other_families_are_unsupported() {
        // Zen 2 reports family 0xf.
        assert!(lbr_capacity_for(CpuSignature {
            family: 0xf,
            model: 0x31
        })
        .is_err());
    }

    #[test]
    fn table_has_no_duplicates() {
        let mut models: Vec<u32> = CPU_LBR_MAPS.iter().map(|m| m.model).collect();
        models.sort();
        models.dedup();
        assert_eq!(CPU_LBR_MAPS.len(), models.len());
    }
}
