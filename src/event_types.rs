//! Event type registry.
//!
//! Every event the engine can deliver is described by one immutable
//! [`WebhookEventSpec`]. The registry is assembled once while wiring the
//! application and shared by reference afterwards.

use std::collections::HashMap;

/// Subscribes a webhook to every event type.
pub const ANY_EVENTS: &str = "any_events";

pub const ORDER_CREATED: &str = "order_created";
pub const ORDER_UPDATED: &str = "order_updated";
pub const ORDER_FULLY_PAID: &str = "order_fully_paid";
pub const ORDER_CANCELLED: &str = "order_cancelled";
pub const ORDER_BULK_CREATED: &str = "order_bulk_created";
pub const PRODUCT_CREATED: &str = "product_created";
pub const PRODUCT_UPDATED: &str = "product_updated";
pub const PRODUCT_DELETED: &str = "product_deleted";
pub const PRODUCT_VARIANT_UPDATED: &str = "product_variant_updated";
pub const CHECKOUT_CREATED: &str = "checkout_created";
pub const CHECKOUT_UPDATED: &str = "checkout_updated";
pub const CUSTOMER_CREATED: &str = "customer_created";
pub const CUSTOMER_UPDATED: &str = "customer_updated";

pub const CHECKOUT_CALCULATE_TAXES: &str = "checkout_calculate_taxes";
pub const ORDER_CALCULATE_TAXES: &str = "order_calculate_taxes";
pub const SHIPPING_LIST_METHODS_FOR_CHECKOUT: &str = "shipping_list_methods_for_checkout";
pub const CHECKOUT_FILTER_SHIPPING_METHODS: &str = "checkout_filter_shipping_methods";
pub const ORDER_FILTER_SHIPPING_METHODS: &str = "order_filter_shipping_methods";
pub const PAYMENT_GATEWAY_INITIALIZE_SESSION: &str = "payment_gateway_initialize_session";
pub const TRANSACTION_INITIALIZE_SESSION: &str = "transaction_initialize_session";
pub const TRANSACTION_PROCESS_SESSION: &str = "transaction_process_session";
pub const STORED_PAYMENT_METHOD_REQUEST_DELETE: &str = "stored_payment_method_request_delete";

pub const MANAGE_ORDERS: &str = "MANAGE_ORDERS";
pub const MANAGE_PRODUCTS: &str = "MANAGE_PRODUCTS";
pub const MANAGE_CHECKOUTS: &str = "MANAGE_CHECKOUTS";
pub const MANAGE_USERS: &str = "MANAGE_USERS";
pub const MANAGE_SHIPPING: &str = "MANAGE_SHIPPING";
pub const HANDLE_TAXES: &str = "HANDLE_TAXES";
pub const HANDLE_PAYMENTS: &str = "HANDLE_PAYMENTS";

/// Immutable description of one event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEventSpec {
    /// Tag used by domain code and stored on deliveries.
    pub event_type: String,

    /// GraphQL type implementing this event, matched by inline fragments.
    pub subscription_type: String,

    /// Field of the event object holding the subscribable entity.
    pub subject_field: String,

    /// Field holding auxiliary context, when the event carries one.
    pub context_field: Option<String>,

    /// Permission the receiving app must hold.
    pub permission: Option<String>,
    pub is_sync: bool,

    /// Dotted field paths that may not be resolved while the event is
    /// evaluated synchronously.
    pub sync_forbidden_fields: Vec<String>,
}

impl WebhookEventSpec {
    pub fn async_event(
        event_type: impl Into<String>,
        subscription_type: impl Into<String>,
        subject_field: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            subscription_type: subscription_type.into(),
            subject_field: subject_field.into(),
            context_field: None,
            permission: None,
            is_sync: false,
            sync_forbidden_fields: Vec::new(),
        }
    }

    pub fn sync_event(
        event_type: impl Into<String>,
        subscription_type: impl Into<String>,
        subject_field: impl Into<String>,
    ) -> Self {
        Self {
            is_sync: true,
            ..Self::async_event(event_type, subscription_type, subject_field)
        }
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permission = Some(permission.into());
        self
    }

    pub fn with_context_field(mut self, field: impl Into<String>) -> Self {
        self.context_field = Some(field.into());
        self
    }

    pub fn with_sync_forbidden_field(mut self, path: impl Into<String>) -> Self {
        self.sync_forbidden_fields.push(path.into());
        self
    }
}

/// Immutable event-type lookup table.
#[derive(Debug, Clone, Default)]
pub struct EventRegistry {
    specs: HashMap<String, WebhookEventSpec>,
}

#[derive(Debug, Default)]
pub struct EventRegistryBuilder {
    specs: Vec<WebhookEventSpec>,
}

impl EventRegistryBuilder {
    /// Later registrations of the same event type replace earlier ones.
    pub fn register(mut self, spec: WebhookEventSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn build(self) -> EventRegistry {
        let specs = self
            .specs
            .into_iter()
            .map(|spec| (spec.event_type.clone(), spec))
            .collect();
        EventRegistry { specs }
    }
}

impl EventRegistry {
    pub fn builder() -> EventRegistryBuilder {
        EventRegistryBuilder::default()
    }

    pub fn get(&self, event_type: &str) -> Option<&WebhookEventSpec> {
        self.specs.get(event_type)
    }

    pub fn is_subscribable(&self, event_type: &str) -> bool {
        self.specs.contains_key(event_type)
    }

    pub fn is_sync(&self, event_type: &str) -> bool {
        self.specs.get(event_type).map(|s| s.is_sync).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Registry with the standard commerce event set.
    pub fn default_registry() -> Self {
        Self::builder()
            .register(WebhookEventSpec::async_event(ORDER_CREATED, "OrderCreated", "order").with_permission(MANAGE_ORDERS))
            .register(WebhookEventSpec::async_event(ORDER_UPDATED, "OrderUpdated", "order").with_permission(MANAGE_ORDERS))
            .register(WebhookEventSpec::async_event(ORDER_FULLY_PAID, "OrderFullyPaid", "order").with_permission(MANAGE_ORDERS))
            .register(WebhookEventSpec::async_event(ORDER_CANCELLED, "OrderCancelled", "order").with_permission(MANAGE_ORDERS))
            .register(WebhookEventSpec::async_event(ORDER_BULK_CREATED, "OrderBulkCreated", "orders").with_permission(MANAGE_ORDERS))
            .register(WebhookEventSpec::async_event(PRODUCT_CREATED, "ProductCreated", "product").with_permission(MANAGE_PRODUCTS))
            .register(WebhookEventSpec::async_event(PRODUCT_UPDATED, "ProductUpdated", "product").with_permission(MANAGE_PRODUCTS))
            .register(WebhookEventSpec::async_event(PRODUCT_DELETED, "ProductDeleted", "product").with_permission(MANAGE_PRODUCTS))
            .register(
                WebhookEventSpec::async_event(PRODUCT_VARIANT_UPDATED, "ProductVariantUpdated", "productVariant")
                    .with_permission(MANAGE_PRODUCTS),
            )
            .register(WebhookEventSpec::async_event(CHECKOUT_CREATED, "CheckoutCreated", "checkout").with_permission(MANAGE_CHECKOUTS))
            .register(WebhookEventSpec::async_event(CHECKOUT_UPDATED, "CheckoutUpdated", "checkout").with_permission(MANAGE_CHECKOUTS))
            .register(WebhookEventSpec::async_event(CUSTOMER_CREATED, "CustomerCreated", "user").with_permission(MANAGE_USERS))
            .register(WebhookEventSpec::async_event(CUSTOMER_UPDATED, "CustomerUpdated", "user").with_permission(MANAGE_USERS))
            .register(WebhookEventSpec::sync_event(CHECKOUT_CALCULATE_TAXES, "CalculateTaxes", "taxBase").with_permission(HANDLE_TAXES))
            .register(WebhookEventSpec::sync_event(ORDER_CALCULATE_TAXES, "CalculateTaxes", "taxBase").with_permission(HANDLE_TAXES))
            .register(
                WebhookEventSpec::sync_event(SHIPPING_LIST_METHODS_FOR_CHECKOUT, "ShippingListMethodsForCheckout", "checkout")
                    .with_permission(MANAGE_SHIPPING)
                    .with_sync_forbidden_field("checkout.shippingMethods")
                    .with_sync_forbidden_field("checkout.availableShippingMethods"),
            )
            .register(
                WebhookEventSpec::sync_event(CHECKOUT_FILTER_SHIPPING_METHODS, "CheckoutFilterShippingMethods", "checkout")
                    .with_permission(MANAGE_CHECKOUTS)
                    .with_context_field("shippingMethods")
                    .with_sync_forbidden_field("checkout.shippingMethods")
                    .with_sync_forbidden_field("checkout.availableShippingMethods")
                    .with_sync_forbidden_field("checkout.deliveryMethod"),
            )
            .register(
                WebhookEventSpec::sync_event(ORDER_FILTER_SHIPPING_METHODS, "OrderFilterShippingMethods", "order")
                    .with_permission(MANAGE_ORDERS)
                    .with_context_field("shippingMethods")
                    .with_sync_forbidden_field("order.shippingMethods")
                    .with_sync_forbidden_field("order.availableShippingMethods"),
            )
            .register(
                WebhookEventSpec::sync_event(PAYMENT_GATEWAY_INITIALIZE_SESSION, "PaymentGatewayInitializeSession", "sourceObject")
                    .with_permission(HANDLE_PAYMENTS)
                    .with_context_field("data"),
            )
            .register(
                WebhookEventSpec::sync_event(TRANSACTION_INITIALIZE_SESSION, "TransactionInitializeSession", "transaction")
                    .with_permission(HANDLE_PAYMENTS)
                    .with_context_field("action"),
            )
            .register(
                WebhookEventSpec::sync_event(TRANSACTION_PROCESS_SESSION, "TransactionProcessSession", "transaction")
                    .with_permission(HANDLE_PAYMENTS)
                    .with_context_field("action"),
            )
            .register(
                WebhookEventSpec::sync_event(STORED_PAYMENT_METHOD_REQUEST_DELETE, "StoredPaymentMethodDeleteRequested", "user")
                    .with_permission(HANDLE_PAYMENTS)
                    .with_context_field("paymentMethodId"),
            )
            .build()
    }
}
