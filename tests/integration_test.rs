#[cfg(feature = "sqlite")]
mod sqlite_tests {
    use aggregate_store::prelude::*;
    use aggregate_store::{CollectionDecl, EmbeddedField, SqlValue};
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use std::collections::{BTreeMap, BTreeSet};
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq)]
    struct Money {
        amount: i64,
        currency: String,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: Uuid,
        sku: String,
        qty: i64,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Shipping {
        id: Uuid,
        street: String,
        verified: bool,
        fee: Option<Money>,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Order {
        id: Uuid,
        customer_name: String,
        placed_at: Option<DateTime<Utc>>,
        weight: Option<f64>,
        price: Option<Money>,
        shipping: Option<Shipping>,
        items: Vec<Item>,
        tags: BTreeSet<String>,
        limits: BTreeMap<String, Money>,
        notes: Option<Vec<String>>,
    }

    fn money_descriptor() -> ValueObjectDescriptor {
        ValueObjectDescriptor::new(
            "Money",
            vec![
                ScalarField::required("amount", ScalarType::Integer),
                ScalarField::required("currency", ScalarType::Text),
            ],
        )
    }

    fn missing(field: &str) -> RepositoryError {
        RepositoryError::deserialization("order", field, "missing or mistyped")
    }

    fn text(value: Option<&Scalar>, field: &str) -> Result<String> {
        value
            .and_then(Scalar::as_text)
            .map(str::to_string)
            .ok_or_else(|| missing(field))
    }

    fn integer(value: Option<&Scalar>, field: &str) -> Result<i64> {
        value.and_then(Scalar::as_integer).ok_or_else(|| missing(field))
    }

    fn money_to_value(money: &Money) -> ValueObject {
        ValueObject::new()
            .with("amount", money.amount)
            .with("currency", money.currency.as_str())
    }

    fn money_from_value(value: &ValueObject) -> Result<Money> {
        Ok(Money {
            amount: integer(value.get("amount"), "amount")?,
            currency: text(value.get("currency"), "currency")?,
        })
    }

    fn item_from_entity(entity: &Entity) -> Result<Item> {
        Ok(Item {
            id: entity.id,
            sku: text(entity.get("sku"), "items.sku")?,
            qty: integer(entity.get("qty"), "items.qty")?,
        })
    }

    impl AggregateRoot for Order {
        fn descriptor() -> Result<AggregateDescriptor> {
            let item = EntityDescriptor::new(
                "Item",
                vec![
                    ScalarField::required("sku", ScalarType::Text),
                    ScalarField::required("qty", ScalarType::Integer),
                ],
            );
            let shipping = EntityDescriptor::new(
                "Shipping",
                vec![
                    ScalarField::required("street", ScalarType::Text),
                    ScalarField::required("verified", ScalarType::Boolean),
                ],
            )
            .with_embedded(EmbeddedField::optional("fee", money_descriptor()));

            AggregateDescriptor::builder("order")
                .scalar("customer_name", ScalarType::Text)
                .optional_scalar("placed_at", ScalarType::Timestamp)
                .optional_scalar("weight", ScalarType::Real)
                .optional_embedded("price", money_descriptor())
                .optional_entity("shipping", shipping)
                .list("items", TypeRef::Entity(item))
                .set("tags", TypeRef::Scalar(ScalarType::Text))
                .map(
                    "limits",
                    TypeRef::Scalar(ScalarType::Text),
                    TypeRef::ValueObject(money_descriptor()),
                )
                .collection(CollectionDecl::list("notes", TypeRef::Scalar(ScalarType::Text)).nullable())
                .build()
        }

        fn id(&self) -> Uuid {
            self.id
        }

        fn to_aggregate(&self) -> Aggregate {
            let mut aggregate = Aggregate::new(self.id)
                .with("customer_name", self.customer_name.as_str())
                .with_embedded("price", self.price.as_ref().map(money_to_value))
                .with_entity(
                    "shipping",
                    self.shipping.as_ref().map(|s| {
                        Entity::new(s.id)
                            .with("street", s.street.as_str())
                            .with("verified", s.verified)
                            .with_embedded("fee", s.fee.as_ref().map(money_to_value))
                    }),
                )
                .with_collection(
                    "items",
                    Some(CollectionValue::list(self.items.iter().map(|i| {
                        Entity::new(i.id)
                            .with("sku", i.sku.as_str())
                            .with("qty", i.qty)
                    }))),
                )
                .with_collection(
                    "tags",
                    Some(CollectionValue::set(
                        self.tags.iter().map(|t| Scalar::from(t.as_str())),
                    )),
                )
                .with_collection(
                    "limits",
                    Some(CollectionValue::map(
                        self.limits
                            .iter()
                            .map(|(k, m)| (k.as_str(), money_to_value(m))),
                    )),
                )
                .with_collection(
                    "notes",
                    self.notes.as_ref().map(|notes| {
                        CollectionValue::list(notes.iter().map(|n| Scalar::from(n.as_str())))
                    }),
                );

            aggregate = match self.placed_at {
                Some(ts) => aggregate.with("placed_at", ts),
                None => aggregate.with_null("placed_at"),
            };
            match self.weight {
                Some(w) => aggregate.with("weight", w),
                None => aggregate.with_null("weight"),
            }
        }

        fn from_aggregate(aggregate: Aggregate) -> Result<Self> {
            let shipping = match aggregate.entity("shipping") {
                Some(entity) => Some(Shipping {
                    id: entity.id,
                    street: text(entity.get("street"), "shipping.street")?,
                    verified: entity
                        .get("verified")
                        .and_then(Scalar::as_bool)
                        .ok_or_else(|| missing("shipping.verified"))?,
                    fee: entity
                        .embedded
                        .get("fee")
                        .and_then(Option::as_ref)
                        .map(money_from_value)
                        .transpose()?,
                }),
                None => None,
            };

            let items = aggregate
                .collection("items")
                .map(|c| c.elements())
                .unwrap_or(&[])
                .iter()
                .map(|e| e.as_entity().ok_or_else(|| missing("items")).and_then(item_from_entity))
                .collect::<Result<Vec<_>>>()?;

            let tags = aggregate
                .collection("tags")
                .map(|c| c.elements())
                .unwrap_or(&[])
                .iter()
                .map(|e| text(e.as_scalar(), "tags"))
                .collect::<Result<BTreeSet<_>>>()?;

            let limits = aggregate
                .collection("limits")
                .map(|c| c.entries())
                .unwrap_or(&[])
                .iter()
                .map(|(k, v)| {
                    let key = text(Some(k), "limits")?;
                    let value = v.as_value_object().ok_or_else(|| missing("limits"))?;
                    Ok((key, money_from_value(value)?))
                })
                .collect::<Result<BTreeMap<_, _>>>()?;

            let notes = aggregate
                .collection("notes")
                .map(|c| {
                    c.elements()
                        .iter()
                        .map(|e| text(e.as_scalar(), "notes"))
                        .collect::<Result<Vec<_>>>()
                })
                .transpose()?;

            Ok(Order {
                id: aggregate.id,
                customer_name: text(aggregate.get("customer_name"), "customer_name")?,
                placed_at: aggregate.get("placed_at").and_then(Scalar::as_timestamp),
                weight: aggregate.get("weight").and_then(Scalar::as_real),
                price: aggregate.embedded("price").map(money_from_value).transpose()?,
                shipping,
                items,
                tags,
                limits,
                notes,
            })
        }
    }

    /// Aggregate whose descriptor references another aggregate root.
    struct Invoice;

    impl AggregateRoot for Invoice {
        fn descriptor() -> Result<AggregateDescriptor> {
            AggregateDescriptor::builder("invoice")
                .list("orders", TypeRef::AggregateRoot("Order".to_string()))
                .build()
        }

        fn id(&self) -> Uuid {
            Uuid::nil()
        }

        fn to_aggregate(&self) -> Aggregate {
            Aggregate::new(Uuid::nil())
        }

        fn from_aggregate(_aggregate: Aggregate) -> Result<Self> {
            Ok(Invoice)
        }
    }

    fn item(sku: &str, qty: i64) -> Item {
        Item {
            id: Uuid::new_v4(),
            sku: sku.to_string(),
            qty,
        }
    }

    fn simple_order(name: &str, items: Vec<Item>) -> Order {
        Order {
            id: Uuid::new_v4(),
            customer_name: name.to_string(),
            placed_at: None,
            weight: None,
            price: None,
            shipping: None,
            items,
            tags: BTreeSet::new(),
            limits: BTreeMap::new(),
            notes: Some(Vec::new()),
        }
    }

    fn full_order() -> Order {
        let mut limits = BTreeMap::new();
        limits.insert(
            "daily".to_string(),
            Money {
                amount: 500,
                currency: "EUR".to_string(),
            },
        );
        limits.insert(
            "monthly".to_string(),
            Money {
                amount: 9000,
                currency: "EUR".to_string(),
            },
        );

        Order {
            id: Uuid::new_v4(),
            customer_name: "Ada".to_string(),
            placed_at: Some(Utc.with_ymd_and_hms(2024, 3, 9, 17, 45, 12).unwrap()),
            weight: Some(2.5),
            price: Some(Money {
                amount: 1999,
                currency: "EUR".to_string(),
            }),
            shipping: Some(Shipping {
                id: Uuid::new_v4(),
                street: "12 Analytical Row".to_string(),
                verified: true,
                fee: None,
            }),
            items: vec![item("x", 2), item("y", 1), item("z", 7)],
            tags: ["gift", "express"].iter().map(|t| t.to_string()).collect(),
            limits,
            notes: Some(vec!["ring twice".to_string(), "leave at door".to_string()]),
        }
    }

    async fn repository() -> Repository<SqliteBackend, Order> {
        let backend = SqliteBackend::memory().await.unwrap();
        let mut repo = Repository::new(backend).unwrap();
        repo.create_tables().await.unwrap();
        repo
    }

    async fn count_rows(repo: &mut Repository<SqliteBackend, Order>, table: &str, owner: Uuid) -> i64 {
        let sql = format!("SELECT COUNT(*) AS n FROM \"{}\" WHERE \"order_id\" = ?", table);
        let rows = repo
            .backend_mut()
            .query(&sql, &[SqlValue::Bytes(owner.as_bytes().to_vec())])
            .await
            .unwrap();
        rows[0].get("n").as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_full_round_trip() {
        let mut repo = repository().await;
        let order = full_order();

        repo.save(&order).await.unwrap();
        let loaded = repo.get_by_id(order.id).await.unwrap();

        assert_eq!(loaded, order);
    }

    #[tokio::test]
    async fn test_list_keeps_insertion_order() {
        let mut repo = repository().await;
        let order = simple_order("A", vec![item("x", 2), item("y", 1)]);

        repo.save(&order).await.unwrap();
        let loaded = repo.get_by_id(order.id).await.unwrap();

        let skus: Vec<&str> = loaded.items.iter().map(|i| i.sku.as_str()).collect();
        assert_eq!(skus, vec!["x", "y"]);
        assert_eq!(loaded.items, order.items);
    }

    #[tokio::test]
    async fn test_empty_list_stays_empty() {
        let mut repo = repository().await;
        let order = simple_order("A", Vec::new());

        repo.save(&order).await.unwrap();
        let loaded = repo.get_by_id(order.id).await.unwrap();

        assert!(loaded.items.is_empty());
        assert_eq!(count_rows(&mut repo, "order_items_items", order.id).await, 0);
    }

    #[tokio::test]
    async fn test_null_and_empty_collections_load_the_same() {
        let mut repo = repository().await;

        let mut with_null = simple_order("A", Vec::new());
        with_null.notes = None;
        let with_empty = simple_order("B", Vec::new());

        repo.save(&with_null).await.unwrap();
        repo.save(&with_empty).await.unwrap();

        let a = repo.get_by_id(with_null.id).await.unwrap();
        let b = repo.get_by_id(with_empty.id).await.unwrap();

        assert_eq!(a.notes, Some(Vec::new()));
        assert_eq!(a.notes, b.notes);
    }

    #[tokio::test]
    async fn test_create_tables_is_idempotent() {
        let mut repo = repository().await;
        repo.create_tables().await.unwrap();
        repo.create_tables().await.unwrap();

        let tables = repo.backend_mut().list_tables().await.unwrap();
        assert_eq!(
            tables,
            vec![
                "order",
                "order_items_items",
                "order_limits_items",
                "order_notes_items",
                "order_shipping",
                "order_tags_items",
            ]
        );
    }

    #[tokio::test]
    async fn test_save_replaces_child_rows() {
        let mut repo = repository().await;
        let mut order = full_order();
        repo.save(&order).await.unwrap();

        order.items = vec![item("only", 1)];
        order.tags.clear();
        order.shipping = None;
        order.customer_name = "Grace".to_string();
        repo.save(&order).await.unwrap();

        let loaded = repo.get_by_id(order.id).await.unwrap();
        assert_eq!(loaded, order);
        assert_eq!(count_rows(&mut repo, "order_items_items", order.id).await, 1);
        assert_eq!(count_rows(&mut repo, "order_tags_items", order.id).await, 0);
        assert_eq!(count_rows(&mut repo, "order_shipping", order.id).await, 0);
    }

    #[tokio::test]
    async fn test_delete_removes_only_that_aggregate() {
        let mut repo = repository().await;
        let first = full_order();
        let second = full_order();
        repo.save(&first).await.unwrap();
        repo.save(&second).await.unwrap();

        repo.delete_by_id(first.id).await.unwrap();

        assert!(!repo.exists(first.id).await.unwrap());
        for table in ["order_shipping", "order_items_items", "order_tags_items", "order_limits_items", "order_notes_items"] {
            assert_eq!(count_rows(&mut repo, table, first.id).await, 0, "table {}", table);
        }
        assert_eq!(repo.get_by_id(second.id).await.unwrap(), second);
        assert_eq!(count_rows(&mut repo, "order_items_items", second.id).await, 3);
    }

    #[tokio::test]
    async fn test_foreign_keys_cascade_on_root_delete() {
        let mut repo = repository().await;
        let order = full_order();
        repo.save(&order).await.unwrap();

        repo.backend_mut()
            .execute(
                "DELETE FROM \"order\" WHERE \"id\" = ?",
                &[SqlValue::Bytes(order.id.as_bytes().to_vec())],
            )
            .await
            .unwrap();

        assert_eq!(count_rows(&mut repo, "order_items_items", order.id).await, 0);
        assert_eq!(count_rows(&mut repo, "order_shipping", order.id).await, 0);
        assert_eq!(count_rows(&mut repo, "order_limits_items", order.id).await, 0);
    }

    #[tokio::test]
    async fn test_delete_of_unknown_id_is_noop() {
        let mut repo = repository().await;
        repo.delete_by_id(Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn test_nan_weight_is_rejected_before_writing() {
        let mut repo = repository().await;
        let mut order = simple_order("A", vec![item("x", 1)]);
        order.weight = Some(f64::NAN);

        let err = repo.save(&order).await.unwrap_err();

        assert!(matches!(err, RepositoryError::Argument(ref m) if m.contains("weight")));
        assert!(!repo.exists(order.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_twice_is_duplicate() {
        let mut repo = repository().await;
        let order = simple_order("A", vec![item("x", 1)]);

        repo.insert(&order).await.unwrap();
        let err = repo.insert(&order).await.unwrap_err();

        assert_eq!(err.kind(), Some(ErrorKind::Duplicate));
        assert!(err.is_duplicate());
        assert_eq!(count_rows(&mut repo, "order_items_items", order.id).await, 1);
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let mut repo = repository().await;
        let id = Uuid::new_v4();

        let err = repo.get_by_id(id).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::NotFound));
        assert!(err.to_string().contains(&id.to_string()));
        assert!(!repo.exists(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_unit_of_work_leaves_nothing_behind() {
        let mut repo = repository().await;
        let order = full_order();
        let id = order.id;

        let result: Result<()> = repo
            .run_in_transaction(move |repo| {
                Box::pin(async move {
                    repo.save(&order).await?;
                    Err(RepositoryError::Argument("abort".to_string()))
                })
            })
            .await;

        assert!(result.is_err());
        assert!(!repo.exists(id).await.unwrap());
        assert_eq!(count_rows(&mut repo, "order_items_items", id).await, 0);
    }

    #[tokio::test]
    async fn test_nested_failure_rolls_back_outer_work() {
        let mut repo = repository().await;
        let outer = full_order();
        let inner = simple_order("inner", vec![item("x", 1)]);
        let (outer_id, inner_id) = (outer.id, inner.id);

        let result: Result<()> = repo
            .run_in_transaction(move |repo| {
                Box::pin(async move {
                    repo.save(&outer).await?;
                    let nested: Result<()> = repo
                        .run_in_transaction(move |repo| {
                            Box::pin(async move {
                                repo.save(&inner).await?;
                                Err(RepositoryError::Argument("inner failure".to_string()))
                            })
                        })
                        .await;
                    assert!(nested.is_err());
                    Ok(())
                })
            })
            .await;

        assert!(matches!(result, Err(RepositoryError::Transaction(_))));
        assert!(!repo.exists(outer_id).await.unwrap());
        assert!(!repo.exists(inner_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_nested_success_commits_once() {
        let mut repo = repository().await;
        let first = simple_order("first", vec![item("a", 1)]);
        let second = simple_order("second", vec![item("b", 2)]);
        let (first_id, second_id) = (first.id, second.id);

        repo.run_in_transaction(move |repo| {
            Box::pin(async move {
                repo.save(&first).await?;
                repo.run_in_transaction(move |repo| Box::pin(async move { repo.save(&second).await }))
                    .await
            })
        })
        .await
        .unwrap();

        assert!(repo.exists(first_id).await.unwrap());
        assert!(repo.exists(second_id).await.unwrap());
        assert_eq!(repo.transactions().depth(), 0);
    }

    #[tokio::test]
    async fn test_absent_optional_parts_load_as_none() {
        let mut repo = repository().await;
        let mut order = full_order();
        order.price = None;
        order.placed_at = None;
        order.weight = None;
        if let Some(shipping) = order.shipping.as_mut() {
            shipping.fee = None;
        }

        repo.save(&order).await.unwrap();
        let loaded = repo.get_by_id(order.id).await.unwrap();

        assert_eq!(loaded.price, None);
        assert_eq!(loaded.placed_at, None);
        assert_eq!(loaded.weight, None);
        assert_eq!(loaded.shipping.as_ref().and_then(|s| s.fee.clone()), None);
        assert_eq!(loaded, order);
    }

    #[tokio::test]
    async fn test_embedded_value_object_in_owned_entity() {
        let mut repo = repository().await;
        let mut order = full_order();
        if let Some(shipping) = order.shipping.as_mut() {
            shipping.fee = Some(Money {
                amount: 450,
                currency: "GBP".to_string(),
            });
        }

        repo.save(&order).await.unwrap();
        let loaded = repo.get_by_id(order.id).await.unwrap();

        assert_eq!(
            loaded.shipping.and_then(|s| s.fee),
            Some(Money {
                amount: 450,
                currency: "GBP".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_timestamp_keeps_microseconds() {
        let mut repo = repository().await;
        let mut order = simple_order("A", Vec::new());
        let base = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        order.placed_at = Some(base + TimeDelta::nanoseconds(123_456_789));

        repo.save(&order).await.unwrap();
        let loaded = repo.get_by_id(order.id).await.unwrap();

        assert_eq!(loaded.placed_at, Some(base + TimeDelta::microseconds(123_456)));
    }

    #[tokio::test]
    async fn test_map_and_set_round_trip() {
        let mut repo = repository().await;
        let order = full_order();
        repo.save(&order).await.unwrap();

        let loaded = repo.get_by_id(order.id).await.unwrap();
        assert_eq!(loaded.tags, order.tags);
        assert_eq!(loaded.limits.len(), 2);
        assert_eq!(loaded.limits["monthly"].amount, 9000);
        assert_eq!(count_rows(&mut repo, "order_limits_items", order.id).await, 2);
    }

    #[tokio::test]
    async fn test_invalid_descriptor_is_rejected_at_construction() {
        let backend = SqliteBackend::memory().await.unwrap();
        let err = match Repository::<_, Invoice>::new(backend) {
            Ok(_) => panic!("descriptor referencing an aggregate root was accepted"),
            Err(err) => err,
        };

        match err {
            RepositoryError::Descriptor { field, suggestion, .. } => {
                assert_eq!(field, "orders");
                assert!(!suggestion.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_drop_tables() {
        let mut repo = repository().await;
        repo.drop_tables().await.unwrap();

        let tables = repo.backend_mut().list_tables().await.unwrap();
        assert!(tables.is_empty());
    }
}
