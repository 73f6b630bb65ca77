mod common;

use aero_vmx::caps::{misc, ControlMask, VmxFeatureOverrides};
use aero_vmx::controls::{PinControls, SecondaryControls};
use aero_vmx::fields;
use aero_vmx::{
    CapabilityError, IsaFeatures, VmcsLayout, VmxCapabilities, VmxConfig, VmxContext,
    VmxFeatures, VmxProfile,
};
use proptest::prelude::*;

#[test]
fn default_config_matches_default_capabilities() {
    common::init_tracing();
    let caps = VmxConfig::default().build().unwrap();
    assert_eq!(caps, VmxCapabilities::default());
    assert_eq!(caps.profile, VmxProfile::Ept);
    assert_eq!(caps.physical_address_bits, 40);
    assert_eq!(caps.linear_address_bits, 48);
    assert_eq!(caps.cr3_target_count(), 4);
    assert!(caps.misc_has(misc::STORE_LMA_ON_EXIT));
    assert!(!caps.misc_has(misc::VMWRITE_READ_ONLY_FIELDS));
}

#[test]
fn default_control_masks() {
    let caps = VmxCapabilities::default();
    assert_eq!(caps.pin.allowed0, 0x16);
    assert_eq!(caps.proc.allowed0, 0x0400_6172);
    assert_eq!(caps.exit.allowed0, 0x0003_6DFB);
    assert_eq!(caps.entry.allowed0, 0x0000_11FB);
    assert_eq!(caps.secondary.allowed0, 0);

    assert!(caps.pin.accepts(0x16 | PinControls::PREEMPTION_TIMER.bits()));
    assert!(!caps.pin.accepts(0x16 | PinControls::POSTED_INTERRUPTS.bits()));
    assert!(caps.secondary.accepts(
        (SecondaryControls::EPT | SecondaryControls::VPID | SecondaryControls::UNRESTRICTED_GUEST)
            .bits()
    ));
    assert!(!caps.secondary.accepts(SecondaryControls::VMCS_SHADOWING.bits()));

    // Bits 31:0 hold allowed-0 and bits 63:32 allowed-1.
    let msr = caps.pin.msr_value();
    assert_eq!(msr as u32, caps.pin.allowed0);
    assert_eq!((msr >> 32) as u32, caps.pin.allowed1);
}

#[test]
fn config_from_json() {
    let config = VmxConfig::from_json_str(
        r#"{
            "profile": "basic",
            "enable": ["preemption_timer"],
            "isa_enable": ["X2APIC"],
            "physical_address_bits": 46,
            "linear_address_bits": 57
        }"#,
    )
    .unwrap();
    assert_eq!(config.profile, VmxProfile::Basic);

    let caps = config.build().unwrap();
    assert!(caps.supports(VmxFeatures::PREEMPTION_TIMER));
    assert!(!caps.supports(VmxFeatures::EPT));
    assert!(caps.has_isa(IsaFeatures::X2APIC));
    assert_eq!(caps.ept_vpid, 0);
    // Legacy masks: no relaxed default1 bits.
    assert_eq!(caps.proc.allowed0, 0x0401_E172);
    assert!(!caps.misc_has(misc::STORE_LMA_ON_EXIT));
    assert!(caps.is_valid_phys_addr((1 << 46) - 1));
    assert!(!caps.is_valid_phys_addr(1 << 46));
    assert!(caps.is_canonical(0x00FF_FFFF_FFFF_FFFF));
    assert!(!caps.is_canonical(0x0100_0000_0000_0000));

    let ctx = VmxContext::from_config(&config).unwrap();
    assert_eq!(ctx.caps, caps);
}

#[test]
fn config_errors() {
    let build = |json: &str| VmxConfig::from_json_str(json).and_then(|c| c.build());

    assert!(matches!(
        build(r#"{ "disable": ["HYPERDRIVE"] }"#),
        Err(CapabilityError::UnknownFeature(name)) if name == "HYPERDRIVE"
    ));
    assert!(matches!(
        build(r#"{ "physical_address_bits": 64 }"#),
        Err(CapabilityError::PhysicalAddressWidth(64))
    ));
    assert!(matches!(
        build(r#"{ "linear_address_bits": 52 }"#),
        Err(CapabilityError::LinearAddressWidth(52))
    ));
    assert!(matches!(
        build(r#"{ "profile": "turbo" }"#),
        Err(CapabilityError::Json(_))
    ));
    assert!(matches!(
        build(r#"{ "enabled": [] }"#),
        Err(CapabilityError::Json(_))
    ));
    // The Ept profile keeps unrestricted guest, which cannot work without EPT.
    assert!(matches!(
        build(r#"{ "disable": ["EPT"] }"#),
        Err(CapabilityError::MissingDependency {
            feature: "UNRESTRICTED_GUEST",
            requires: "EPT"
        })
    ));
    assert!(matches!(
        build(r#"{ "profile": "basic", "disable": ["TPR_SHADOW"] }"#),
        Err(CapabilityError::MissingDependency {
            feature: "APIC_VIRTUALIZATION",
            requires: "TPR_SHADOW"
        })
    ));
}

#[test]
fn layout_follows_capabilities() {
    let default = VmcsLayout::for_capabilities(&VmxCapabilities::default());
    assert!(default.is_valid(fields::EPTP));
    assert!(default.is_valid(fields::VPID));
    assert!(!default.is_valid(fields::VMREAD_BITMAP_ADDR));
    assert!(!default.is_valid(fields::GUEST_PML_INDEX));

    let shadowing = VmxCapabilities::from_profile(
        VmxProfile::Ept,
        VmxFeatureOverrides {
            force_enable: VmxFeatures::VMCS_SHADOWING,
            ..VmxFeatureOverrides::default()
        },
    )
    .unwrap();
    assert!(shadowing.misc_has(misc::VMWRITE_READ_ONLY_FIELDS));
    let layout = VmcsLayout::for_capabilities(&shadowing);
    assert!(layout.is_valid(fields::VMREAD_BITMAP_ADDR));
    assert!(layout.is_valid(fields::VMWRITE_BITMAP_ADDR));

    let basic =
        VmxCapabilities::from_profile(VmxProfile::Basic, VmxFeatureOverrides::default()).unwrap();
    let layout = VmcsLayout::for_capabilities(&basic);
    assert!(!layout.is_valid(fields::EPTP));
    assert!(!layout.is_valid(fields::VPID));
    assert!(!layout.is_valid(fields::GUEST_PREEMPTION_TIMER_VALUE));
    // Fields every profile has.
    for encoding in [fields::GUEST_RIP, fields::HOST_RIP, fields::VMCS_LINK_POINTER] {
        assert!(layout.is_valid(encoding), "{encoding:#06x}");
    }
}

proptest! {
    #[test]
    fn control_mask_accepts_exactly_the_allowed_settings(
        allowed0 in any::<u32>(),
        supported in any::<u32>(),
        value in any::<u32>(),
    ) {
        let mask = ControlMask::new(allowed0, supported);
        let expected = value & allowed0 == allowed0 && value & !(allowed0 | supported) == 0;
        prop_assert_eq!(mask.accepts(value), expected);
        prop_assert!(mask.accepts(mask.allowed0));
        prop_assert!(mask.accepts(mask.allowed1));
    }

    #[test]
    fn canonical_addresses_sign_extend_bit_47(addr in any::<u64>()) {
        let caps = VmxCapabilities::default();
        let top = addr >> 47;
        let expected = top == 0 || top == (1 << 17) - 1;
        prop_assert_eq!(caps.is_canonical(addr), expected);
    }
}
