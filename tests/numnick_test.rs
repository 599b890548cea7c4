//! Numnick allocation scenarios from the design doc's testable-properties section:
//! slot exhaustion/reuse and remote-announce ghost collisions.
//!
//! Run with: cargo test --test numnick_test

use ircd_core::numnick::{capacity_mask, ClientTable, ServerTable};

#[test]
fn numnick_round_trip_for_every_digit_width() {
    use ircd_core::numnick::{decode, encode};
    for &digits in &[2u32, 3, 5] {
        let top = 1u32 << (digits * 6).min(31);
        for k in [0u32, 1, 63, top.saturating_sub(1)] {
            assert_eq!(decode(&encode(k, digits)), k);
        }
    }
}

#[test]
fn small_max_clients_still_floors_at_sixteen_slots() {
    // `SetYXXCapacity` in the original starts `max_clients` at 16 and only doubles;
    // a server configured for 2 clients still gets the 16-slot (mask 15) floor.
    assert_eq!(capacity_mask(2), Some(15));
    assert_eq!(capacity_mask(17), Some(31));
}

#[test]
fn numnick_exhaustion_then_release_and_reuse() {
    // Scenario 4 (§8.3), scaled to this server's 16-slot floor: fill every slot, the
    // next reserve fails, releasing one frees a slot for the next reserve.
    let mut table: ClientTable<u32> = ClientTable::with_capacity(2);
    assert_eq!(table.mask(), 15);

    let mut slots = Vec::new();
    for name in 0..16u32 {
        let (slot, _yxx) = table.reserve_local(name).expect("all sixteen slots should be free");
        slots.push(slot);
    }
    assert_eq!(slots.len(), 16);

    assert!(table.reserve_local(99).is_none(), "reserve past the last free slot must fail");

    let freed = slots[5];
    table.remove(freed);
    let (reused, _yxx) = table.reserve_local(100).expect("reserve should succeed after a release");
    assert_eq!(reused, freed, "next reserve should reuse the just-freed slot");
}

#[test]
fn remote_announce_ghost_collision_evicts_prior_occupant() {
    // Scenario 5 (§8.3): a local client holds slot 7; a remote burst announces a new
    // client at the same slot. The prior occupant must come back as the "ghost" so
    // the embedder can disconnect it with a numeric-collision reason.
    let mut table: ClientTable<&str> = ClientTable::with_capacity(8); // mask covers slot 7
    assert!(table.set_remote(7, "local-x").is_none());
    assert_eq!(table.get(7), Some(&"local-x"));

    let ghost = table.set_remote(7, "remote-y");
    assert_eq!(ghost, Some("local-x"), "prior occupant must be returned for forced disconnection");
    assert_eq!(table.get(7), Some(&"remote-y"), "new client must be installed at the contested slot");
}

#[test]
fn find_by_yxx_resolves_server_then_slot_forms() {
    let mut servers: ServerTable<&str> = ServerTable::new();
    servers.set_server_yxx(ircd_core::numnick::decode("AB"), "hub");

    let mut clients: ClientTable<&str> = ClientTable::with_capacity(8);
    clients.set_remote(3, "alice");

    // A 2-char form is the plain `YY` server lookup.
    assert_eq!(servers.find("AB"), Some(&"hub"));
    // 5-char forms look up the server by its first two chars, then the slot.
    assert_eq!(servers.find("ABxyz"), Some(&"hub"));
    assert_eq!(clients.get(3), Some(&"alice"));
}

#[test]
fn find_by_three_char_form_uses_single_char_server_prefix() {
    // A 3-char numnick is the smaller combined form (1-char server + 2-char
    // client), so its server prefix is decoded as a single character, not the
    // first two — a different server index than the 2-char `YY` form would give.
    let mut servers: ServerTable<&str> = ServerTable::new();
    servers.set_server_yxx(ircd_core::numnick::decode("A"), "edge");
    assert_eq!(servers.find("Axy"), Some(&"edge"));
}
