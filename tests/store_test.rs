//! Strategy store round-trips: every variant, alias canonicalization, and
//! atomic update behavior.

mod common;

use chrono::Duration;
use tempfile::TempDir;

use common::{base_time, bracket_strategy, scale_out_strategy, trailing_strategy};
use tradeloop::adapters::json_store_adapter::JsonStoreAdapter;
use tradeloop::domain::strategy::{GridLevel, Phase, Strategy, VariantParams};
use tradeloop::domain::order::OrderSide;
use tradeloop::ports::store_port::StrategyStorePort;

fn grid_strategy(id: &str) -> Strategy {
    let mut s = Strategy::new(
        "SPY",
        VariantParams::Grid {
            reference_price: 400.0,
            spacing_pct: 1.0,
            levels_per_side: 3,
        },
        5,
        base_time(),
    );
    s.id = id.to_string();
    s
}

fn pullback_strategy(id: &str) -> Strategy {
    let mut s = Strategy::new(
        "AAPL",
        VariantParams::PullbackTrailing {
            pullback_pct: 3.0,
            trailing_pct: 5.0,
        },
        10,
        base_time(),
    );
    s.id = id.to_string();
    s
}

#[test]
fn every_variant_round_trips_with_runtime_state() {
    let dir = TempDir::new().unwrap();
    let store = JsonStoreAdapter::new(dir.path());

    let mut trailing = trailing_strategy("var-trail", "AAPL", 10, 5.0);
    trailing.phase = Phase::PositionOpen;
    trailing.runtime.entry_fill_price = Some(101.25);
    trailing.runtime.high_watermark = Some(108.5);
    trailing.runtime.entry_order_id = Some("var-trail-1".into());

    let mut bracket = bracket_strategy("var-brkt", "MSFT", 20, 10.0, 5.0);
    bracket.phase = Phase::Exiting;
    bracket.runtime.entry_fill_price = Some(310.0);
    bracket.runtime.tp_order_id = Some("var-brkt-2".into());
    bracket.runtime.sl_order_id = Some("var-brkt-3".into());
    bracket.runtime.exit_order_ids = vec!["var-brkt-2".into(), "var-brkt-3".into()];
    bracket.runtime.oco_cancel_attempts = 2;

    let mut scale = scale_out_strategy("var-scal", "NVDA", 30, &[(5.0, 0.5), (10.0, 0.5)]);
    scale.runtime.rungs_filled = 1;

    let mut grid = grid_strategy("var-grid");
    grid.phase = Phase::PositionOpen;
    grid.runtime.grid_levels = vec![GridLevel {
        price: 396.0,
        side: OrderSide::Buy,
        order_id: Some("var-grid-1".into()),
        filled: true,
    }];

    let pullback = pullback_strategy("var-pull");

    for strategy in [&trailing, &bracket, &scale, &grid, &pullback] {
        store.upsert(strategy).unwrap();
    }

    for strategy in [&trailing, &bracket, &scale, &grid, &pullback] {
        let loaded = store.load(&strategy.id).unwrap();
        assert_eq!(&loaded, strategy, "round trip for {}", strategy.id);
    }
}

#[test]
fn hyphenated_aliases_are_read_and_canonicalized() {
    let aliases = [
        ("trailing-stop", "trailing_stop", r#""trailing_pct": 5.0"#),
        (
            "scale-out",
            "scale_out",
            r#""rungs": [{"gain_pct": 5.0, "fraction": 1.0}]"#,
        ),
        (
            "pullback-trailing",
            "pullback_trailing",
            r#""pullback_pct": 3.0, "trailing_pct": 5.0"#,
        ),
    ];

    for (alias, canonical, params) in aliases {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("strategies.json"),
            format!(
                r#"{{"strategies":[{{
                    "id": "aliased01",
                    "symbol": "AAPL",
                    "variant": "{alias}",
                    {params},
                    "quantity": 10,
                    "enabled": true,
                    "phase": "pending",
                    "created_at": "2024-01-15T14:30:00Z",
                    "updated_at": "2024-01-15T14:30:00Z"
                }}]}}"#
            ),
        )
        .unwrap();

        let store = JsonStoreAdapter::new(dir.path());
        let loaded = store.load("aliased01").unwrap();
        assert_eq!(loaded.params.name(), canonical);

        store.upsert(&loaded).unwrap();
        let written = std::fs::read_to_string(dir.path().join("strategies.json")).unwrap();
        assert!(written.contains(canonical));
        assert!(!written.contains(alias));
    }
}

#[test]
fn upsert_is_atomic_under_existing_readers() {
    let dir = TempDir::new().unwrap();
    let store = JsonStoreAdapter::new(dir.path());

    for i in 0..20 {
        let mut s = trailing_strategy(&format!("strat{i:03}"), "AAPL", 10, 5.0);
        s.quantity = 10 + i;
        store.upsert(&s).unwrap();

        // Every intermediate state parses as a complete document.
        let all = store.load_all().unwrap();
        assert_eq!(all.len(), (i + 1) as usize);
    }
}

#[test]
fn list_active_is_ordered_by_id() {
    let dir = TempDir::new().unwrap();
    let store = JsonStoreAdapter::new(dir.path());

    for id in ["charlie1", "alpha001", "bravo001"] {
        store
            .upsert(&trailing_strategy(id, "AAPL", 10, 5.0))
            .unwrap();
    }

    let ids: Vec<String> = store
        .list_active(base_time())
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(ids, vec!["alpha001", "bravo001", "charlie1"]);
}

#[test]
fn delete_removes_only_the_target() {
    let dir = TempDir::new().unwrap();
    let store = JsonStoreAdapter::new(dir.path());
    store
        .upsert(&trailing_strategy("keep0001", "AAPL", 10, 5.0))
        .unwrap();
    store
        .upsert(&trailing_strategy("drop0001", "MSFT", 10, 5.0))
        .unwrap();

    store.delete("drop0001").unwrap();
    let all = store.load_all().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, "keep0001");
}

#[test]
fn schedule_round_trip_preserves_instant() {
    let dir = TempDir::new().unwrap();
    let store = JsonStoreAdapter::new(dir.path());

    let at = base_time() + Duration::hours(3);
    let mut s = trailing_strategy("sched001", "AAPL", 10, 5.0);
    s.schedule_enabled = true;
    s.schedule_at = Some(at);
    store.upsert(&s).unwrap();

    let loaded = store.load("sched001").unwrap();
    assert_eq!(loaded.schedule_at, Some(at));
    assert!(loaded.schedule_enabled);
    assert!(!loaded.enabled);
}

#[test]
fn invalid_strategy_is_rejected_on_upsert() {
    let dir = TempDir::new().unwrap();
    let store = JsonStoreAdapter::new(dir.path());
    let mut s = trailing_strategy("bad00001", "AAPL", 10, 5.0);
    s.quantity = 0;
    assert!(store.upsert(&s).is_err());
    assert!(store.load_all().unwrap().is_empty());
}
