// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::spec;
use crate::spec::MigrationRegister;
use crate::tests::mocks::LogCall;
use crate::tests::mocks::TestInterfaceBuilder;
use crate::tests::mocks::new_interface;

const SEG: usize = spec::LOG_SEGMENT_SIZE;

// ── Enable ───────────────────────────────────────────────────────────────────

#[test]
fn test_enable_pins_segments_and_starts_backend() {
    let mut mock = new_interface();
    mock.set_log_region(0x10000, (2 * SEG) as u32);
    assert!(mock.write_reg(MigrationRegister::LOG_CTL, spec::LOG_CTL_ENABLE));

    assert!(mock.iface.log_enabled());
    assert_eq!(mock.iface.log_segment_count(), Some(2));
    assert_eq!(*mock.asp.pins.lock(), vec![(0x10000, SEG), (0x11000, SEG)]);
    assert_eq!(
        *mock.log_calls.lock(),
        vec![
            LogCall::SetAddr(vec![(0x10000, SEG), (0x11000, SEG)]),
            LogCall::Start,
        ]
    );
}

#[test]
fn test_enable_rounds_partial_segment_up() {
    let mut mock = new_interface();
    mock.set_log_region(0x10000, (SEG + 1) as u32);
    assert!(mock.write_reg(MigrationRegister::LOG_CTL, spec::LOG_CTL_ENABLE));
    assert_eq!(mock.iface.log_segment_count(), Some(2));
}

#[test]
fn test_enable_rejects_oversized_region_before_mapping() {
    let mut mock = new_interface();
    let size = ((spec::MAX_LOG_SEGMENTS + 1) * SEG) as u32;
    mock.set_log_region(0x10000, size);
    assert!(mock.write_reg(MigrationRegister::LOG_CTL, spec::LOG_CTL_ENABLE));

    assert!(!mock.iface.log_enabled());
    assert!(mock.asp.pins.lock().is_empty());
    assert!(mock.log_calls.lock().is_empty());
}

#[test]
fn test_enable_at_segment_capacity() {
    let mut mock = new_interface();
    mock.set_log_region(0, (spec::MAX_LOG_SEGMENTS * SEG) as u32);
    assert!(mock.write_reg(MigrationRegister::LOG_CTL, spec::LOG_CTL_ENABLE));
    assert_eq!(mock.iface.log_segment_count(), Some(spec::MAX_LOG_SEGMENTS));
}

#[test]
fn test_enable_rejects_zero_size() {
    let mut mock = new_interface();
    mock.set_log_region(0x10000, 0);
    assert!(mock.write_reg(MigrationRegister::LOG_CTL, spec::LOG_CTL_ENABLE));
    assert!(!mock.iface.log_enabled());
    assert!(mock.asp.pins.lock().is_empty());
}

#[test]
fn test_enable_while_enabled_rejected() {
    let mut mock = new_interface();
    mock.set_log_region(0x10000, SEG as u32);
    assert!(mock.write_reg(MigrationRegister::LOG_CTL, spec::LOG_CTL_ENABLE));
    assert!(mock.write_reg(MigrationRegister::LOG_CTL, spec::LOG_CTL_ENABLE));

    // The session from the first enable is untouched.
    assert_eq!(mock.iface.log_segment_count(), Some(1));
    assert_eq!(mock.asp.pins.lock().len(), 1);
    assert_eq!(
        *mock.log_calls.lock(),
        vec![LogCall::SetAddr(vec![(0x10000, SEG)]), LogCall::Start]
    );
}

#[test]
fn test_enable_without_backend_rejected_before_mapping() {
    let mut mock = TestInterfaceBuilder::default().no_log_backend().build();
    mock.set_log_region(0x10000, SEG as u32);
    assert!(mock.write_reg(MigrationRegister::LOG_CTL, spec::LOG_CTL_ENABLE));
    assert!(!mock.iface.log_enabled());
    assert!(mock.asp.pins.lock().is_empty());
}

// ── Disable / reset ──────────────────────────────────────────────────────────

#[test]
fn test_disable_stops_backend_and_releases_session() {
    let mut mock = new_interface();
    mock.set_log_region(0x10000, SEG as u32);
    assert!(mock.write_reg(MigrationRegister::LOG_CTL, spec::LOG_CTL_ENABLE));
    assert!(mock.write_reg(MigrationRegister::LOG_CTL, spec::LOG_CTL_DISABLE));

    assert!(!mock.iface.log_enabled());
    assert_eq!(mock.log_calls.lock().last(), Some(&LogCall::Stop));
}

#[test]
fn test_disable_while_disabled_is_a_noop() {
    let mut mock = new_interface();
    assert!(mock.write_reg(MigrationRegister::LOG_CTL, spec::LOG_CTL_DISABLE));
    assert!(!mock.iface.log_enabled());
    assert!(mock.log_calls.lock().is_empty());
}

#[test]
fn test_enable_disable_enable_builds_independent_sessions() {
    let mut mock = new_interface();
    mock.set_log_region(0x10000, SEG as u32);
    assert!(mock.write_reg(MigrationRegister::LOG_CTL, spec::LOG_CTL_ENABLE));
    assert!(mock.write_reg(MigrationRegister::LOG_CTL, spec::LOG_CTL_DISABLE));

    mock.set_log_region(0x40000, (2 * SEG) as u32);
    assert!(mock.write_reg(MigrationRegister::LOG_CTL, spec::LOG_CTL_ENABLE));

    assert_eq!(mock.iface.log_segment_count(), Some(2));
    assert_eq!(
        *mock.log_calls.lock(),
        vec![
            LogCall::SetAddr(vec![(0x10000, SEG)]),
            LogCall::Start,
            LogCall::Stop,
            LogCall::SetAddr(vec![(0x40000, SEG), (0x41000, SEG)]),
            LogCall::Start,
        ]
    );
}

#[test]
fn test_reset_clears_session_and_registers() {
    let mut mock = new_interface();
    mock.set_log_region(0x10000, SEG as u32);
    assert!(mock.write_reg(MigrationRegister::LOG_CTL, spec::LOG_CTL_ENABLE));
    assert!(mock.write_reg(MigrationRegister::LOG_CTL, spec::LOG_CTL_RESET));

    assert!(!mock.iface.log_enabled());
    assert_eq!(mock.log_calls.lock().last(), Some(&LogCall::Stop));
    assert_eq!(mock.read_reg(MigrationRegister::LOG_BADDR_LO), 0);
    assert_eq!(mock.read_reg(MigrationRegister::LOG_BADDR_HI), 0);
}

#[test]
fn test_reset_while_disabled_is_a_noop() {
    let mut mock = new_interface();
    assert!(mock.write_reg(MigrationRegister::LOG_CTL, spec::LOG_CTL_RESET));
    assert!(mock.log_calls.lock().is_empty());
}

#[test]
fn test_unknown_log_command_ignored() {
    let mut mock = new_interface();
    mock.set_log_region(0x10000, SEG as u32);
    assert!(mock.write_reg(MigrationRegister::LOG_CTL, 9));

    assert!(!mock.iface.log_enabled());
    assert!(mock.log_calls.lock().is_empty());
    assert_eq!(mock.read_reg(MigrationRegister::LOG_BADDR_LO), 0x10000);
}
