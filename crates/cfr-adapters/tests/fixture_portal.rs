use std::path::PathBuf;

use cfr_adapters::{
    Credentials, DetailSource, DriverError, FixturePortalFactory, PortalDriver, SessionFactory,
    StoreSelection, SummaryModal,
};
use cfr_core::{ExpectedCount, ProcessingDate, SummaryRow};
use chrono::NaiveTime;

fn sample_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/portal-sample")
}

#[tokio::test]
async fn sample_capture_replays_every_store_shape() {
    let factory = FixturePortalFactory::from_dir(sample_dir()).expect("bundle loads");
    assert_eq!(factory.bundle().stores.len(), 5);

    let mut session = factory.open_session(1).await.unwrap();
    session
        .login(&Credentials {
            user: "ops".into(),
            password: "pw".into(),
        })
        .await
        .unwrap();

    let window = ProcessingDate::parse("14/10/2025").unwrap().query_window(
        NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
    );

    assert_eq!(
        session.select_store("Loja Centro").await.unwrap(),
        StoreSelection::Active
    );
    session.apply_date_filter(&window).await.unwrap();
    let SummaryModal::Opened(rows) = session.open_summary_modal().await.unwrap() else {
        panic!("summary modal should open");
    };
    let couriers = rows.iter().filter_map(SummaryRow::as_courier).collect::<Vec<_>>();
    assert_eq!(couriers.len(), 3);
    assert_eq!(couriers[0].courier, "12 Ruan Pablo");
    assert_eq!(couriers[1].courier, "MP Ana Souza");
    assert_eq!(couriers[2].pix_key, "-");
    assert!(matches!(rows.last(), Some(SummaryRow::Total { .. })));
    let details = session.fetch_detail_grid().await.unwrap();
    assert_eq!(details.len(), 4);
    assert_eq!(details[2].courier, "12 Ruan Pablo");
    assert_eq!(details[3].payment_method, "Dinheiro");

    assert!(matches!(
        session.select_store("Loja Norte").await,
        Err(DriverError::Transport(_))
    ));
    session.select_store("Loja Norte").await.unwrap();
    session.apply_date_filter(&window).await.unwrap();
    assert_eq!(session.open_summary_modal().await.unwrap(), SummaryModal::TimedOut);
    assert!(matches!(
        session.open_summary_modal().await.unwrap(),
        SummaryModal::Opened(_)
    ));
    assert_eq!(session.fetch_detail_grid().await.unwrap().len(), 4);
    assert_eq!(session.fetch_detail_grid().await.unwrap().len(), 5);

    session.select_store("Loja Sul").await.unwrap();
    session.apply_date_filter(&window).await.unwrap();
    let SummaryModal::Opened(rows) = session.open_summary_modal().await.unwrap() else {
        panic!("summary modal should open");
    };
    assert_eq!(rows[1].as_courier().unwrap().expected(), ExpectedCount::Unknown);

    assert_eq!(
        session.select_store("Loja Leste").await.unwrap(),
        StoreSelection::Inactive
    );

    session.select_store("Loja Oeste").await.unwrap();
    session.apply_date_filter(&window).await.unwrap();
    assert_eq!(session.open_summary_modal().await.unwrap(), SummaryModal::NotFound);
    assert!(session.fetch_detail_grid().await.unwrap().is_empty());

    session.close().await.unwrap();
}

#[tokio::test]
async fn sessions_from_one_factory_keep_independent_cursors() {
    let factory = FixturePortalFactory::from_dir(sample_dir()).unwrap();
    let credentials = Credentials {
        user: "ops".into(),
        password: "pw".into(),
    };
    let window = ProcessingDate::parse("14/10/2025").unwrap().query_window(
        NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
    );

    let mut counts = Vec::new();
    for worker in 1..=2 {
        let mut session = factory.open_session(worker).await.unwrap();
        session.login(&credentials).await.unwrap();
        assert!(session.select_store("Loja Norte").await.is_err());
        session.select_store("Loja Norte").await.unwrap();
        session.apply_date_filter(&window).await.unwrap();
        counts.push(session.fetch_detail_grid().await.unwrap().len());
    }
    assert_eq!(counts, vec![4, 4]);
}
