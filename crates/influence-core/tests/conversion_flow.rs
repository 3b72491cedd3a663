use influence_core::{
    bootstrap_storage, BalanceStore, CatalogConfig, ConversionEngine, ConversionFilter,
    ConversionRejection, HierarchyCatalog, InfluenceError, MemberDirectory, QueryWindow,
    StorageConfig,
};
use influence_types::{BalanceKey, CategoryId, DivisionId, Member, MemberId, Rank};
use std::sync::Arc;

const STANDARD: CategoryId = CategoryId(1);
const PRESTIGE: CategoryId = CategoryId(2);

async fn setup() -> (ConversionEngine, MemberDirectory) {
    let config = CatalogConfig::reference().unwrap();
    let catalog = Arc::new(HierarchyCatalog::from_config(config).unwrap());
    let storage = bootstrap_storage(StorageConfig::memory()).await.unwrap();
    let engine = ConversionEngine::new(catalog.clone(), storage.clone());
    let directory = MemberDirectory::new(catalog, storage);
    (engine, directory)
}

async fn amount(
    engine: &ConversionEngine,
    member: u64,
    division: u64,
    category: CategoryId,
) -> u64 {
    engine
        .storage()
        .get_balance(&BalanceKey::new(member, division, category))
        .await
        .unwrap()
        .map(|b| b.amount)
        .unwrap_or(0)
}

#[tokio::test]
async fn earned_influence_rolls_up_to_the_global_pool() {
    let (engine, directory) = setup().await;
    let member = Member::new(7, "Ilse", 12, Rank::new(2, "Officer"));
    directory.enroll(member, [DivisionId(13)]).await.unwrap();
    directory
        .credit_influence(MemberId(7), DivisionId(12), STANDARD, 100)
        .await
        .unwrap();

    // Research -> Science pool
    let outcome = engine
        .convert_influence(MemberId(7), DivisionId(12), STANDARD, 30, false)
        .await
        .unwrap();
    assert!(outcome.succeeded());
    assert_eq!(amount(&engine, 7, 12, STANDARD).await, 70);
    assert_eq!(amount(&engine, 7, 3, STANDARD).await, 30);

    // Science pool -> global pool
    let outcome = engine
        .convert_influence(MemberId(7), DivisionId(3), STANDARD, 30, false)
        .await
        .unwrap();
    assert!(outcome.succeeded());
    assert_eq!(amount(&engine, 7, 3, STANDARD).await, 0);
    assert_eq!(amount(&engine, 7, 1, STANDARD).await, 30);

    // The global pool is the end of the line.
    let outcome = engine
        .convert_influence(MemberId(7), DivisionId(1), STANDARD, 30, true)
        .await
        .unwrap();
    assert_eq!(outcome.rejection(), Some(ConversionRejection::TerminalSource));

    // Categories never mix.
    assert_eq!(amount(&engine, 7, 1, PRESTIGE).await, 0);

    let member = directory.member(MemberId(7)).await.unwrap();
    assert_eq!(member.total_influence, 100);
    assert_eq!(member.lifetime_influence, 100);
}

#[tokio::test]
async fn audit_log_replays_to_current_balances() {
    let (engine, directory) = setup().await;
    for id in [1u64, 2] {
        let member = Member::new(id, format!("m{id}"), 14, Rank::new(1, "Associate"));
        directory.enroll(member, [DivisionId(15)]).await.unwrap();
        directory
            .credit_influence(MemberId(id), DivisionId(14), PRESTIGE, 40)
            .await
            .unwrap();
        directory
            .credit_influence(MemberId(id), DivisionId(15), PRESTIGE, 10)
            .await
            .unwrap();
    }

    // (member, division, amount, force_to_general)
    let moves = [
        (1u64, 14u64, 15u64, false),
        (1, 4, 0, false),
        (2, 14, 25, true),
        (2, 15, 10, false),
    ];
    for (member, division, amount, force) in moves {
        engine
            .convert_influence(MemberId(member), DivisionId(division), PRESTIGE, amount, force)
            .await
            .unwrap();
    }

    for member in [1u64, 2] {
        let deltas = engine
            .replay_conversions(MemberId(member), Some(PRESTIGE))
            .await
            .unwrap();
        let earned = |division: u64| match division {
            14 => 40,
            15 => 10,
            _ => 0,
        };
        for balance in engine.balances(MemberId(member)).await.unwrap() {
            if balance.category() != PRESTIGE {
                continue;
            }
            let delta = deltas.get(&balance.key).copied().unwrap_or(0);
            assert_eq!(
                i128::from(earned(balance.division().get())) + delta,
                i128::from(balance.amount),
                "balance {}",
                balance.key
            );
        }
    }

    let history = engine
        .conversion_history(&ConversionFilter::default(), QueryWindow::all())
        .await
        .unwrap();
    // The zero-amount move leaves no record.
    assert_eq!(history.len(), 3);
    assert!(history.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert!(engine.verify_audit_log().await.unwrap());

    let paged = engine
        .conversion_history(&ConversionFilter::for_member(MemberId(2)), QueryWindow::page(1, 1))
        .await
        .unwrap();
    assert_eq!(paged.len(), 1);
    assert_eq!(paged[0].from_division, DivisionId(15));
}

#[tokio::test]
async fn unknown_member_is_not_found() {
    let (engine, _) = setup().await;
    let err = engine
        .convert_influence(MemberId(99), DivisionId(12), STANDARD, 1, false)
        .await
        .unwrap_err();
    assert!(matches!(err, InfluenceError::NotFound { .. }));
}
