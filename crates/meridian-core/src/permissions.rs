//! # Role Permissions
//!
//! Static role → permission table and the pure queries over it.
//!
//! ```text
//! ┌──────────┬──────────────────────────────────────────────────────────┐
//! │ admin    │ everything (short-circuit, table not consulted)          │
//! │ manager  │ dashboard, users:view, orders, products, documents,      │
//! │          │ substitutes, reports                                     │
//! │ employee │ dashboard, orders (view/create), products:view,          │
//! │          │ documents:view, notifications                            │
//! │ client   │ orders (view/create), products:view, notifications      │
//! └──────────┴──────────────────────────────────────────────────────────┘
//! ```

use crate::types::{Role, User};

// =============================================================================
// Permission Names
// =============================================================================

pub const VIEW_DASHBOARD: &str = "view_dashboard";
pub const VIEW_USERS: &str = "view_users";
pub const MANAGE_USERS: &str = "manage_users";
pub const VIEW_ORDERS: &str = "view_orders";
pub const CREATE_ORDERS: &str = "create_orders";
pub const MANAGE_ORDERS: &str = "manage_orders";
pub const VIEW_PRODUCTS: &str = "view_products";
pub const MANAGE_PRODUCTS: &str = "manage_products";
pub const VIEW_DOCUMENTS: &str = "view_documents";
pub const MANAGE_DOCUMENTS: &str = "manage_documents";
pub const MANAGE_SUBSTITUTES: &str = "manage_substitutes";
pub const VIEW_REPORTS: &str = "view_reports";
pub const VIEW_NOTIFICATIONS: &str = "view_notifications";
pub const MANAGE_SETTINGS: &str = "manage_settings";

/// Every permission the application knows.
pub const ALL_PERMISSIONS: &[&str] = &[
    VIEW_DASHBOARD,
    VIEW_USERS,
    MANAGE_USERS,
    VIEW_ORDERS,
    CREATE_ORDERS,
    MANAGE_ORDERS,
    VIEW_PRODUCTS,
    MANAGE_PRODUCTS,
    VIEW_DOCUMENTS,
    MANAGE_DOCUMENTS,
    MANAGE_SUBSTITUTES,
    VIEW_REPORTS,
    VIEW_NOTIFICATIONS,
    MANAGE_SETTINGS,
];

/// Permissions granted to `role` by the static table.
pub fn permissions_for(role: Role) -> &'static [&'static str] {
    match role {
        Role::Admin => ALL_PERMISSIONS,
        Role::Manager => &[
            VIEW_DASHBOARD,
            VIEW_USERS,
            VIEW_ORDERS,
            CREATE_ORDERS,
            MANAGE_ORDERS,
            VIEW_PRODUCTS,
            MANAGE_PRODUCTS,
            VIEW_DOCUMENTS,
            MANAGE_DOCUMENTS,
            MANAGE_SUBSTITUTES,
            VIEW_REPORTS,
            VIEW_NOTIFICATIONS,
        ],
        Role::Employee => &[
            VIEW_DASHBOARD,
            VIEW_ORDERS,
            CREATE_ORDERS,
            VIEW_PRODUCTS,
            VIEW_DOCUMENTS,
            VIEW_NOTIFICATIONS,
        ],
        Role::Client => &[VIEW_ORDERS, CREATE_ORDERS, VIEW_PRODUCTS, VIEW_NOTIFICATIONS],
        Role::Unknown => &[],
    }
}

/// Replaces `user.permissions` with the table entry for its role.
pub fn with_role_permissions(mut user: User) -> User {
    user.permissions = permissions_for(user.role)
        .iter()
        .map(|p| p.to_string())
        .collect();
    user
}

// =============================================================================
// Queries
// =============================================================================

pub fn has_permission(user: Option<&User>, permission: &str) -> bool {
    let Some(user) = user else {
        return false;
    };
    if user.role == Role::Admin {
        return true;
    }
    user.permissions.iter().any(|p| p == permission)
}

pub fn has_role(user: Option<&User>, role: Role) -> bool {
    user.is_some_and(|u| u.role == role)
}

pub fn has_any_role(user: Option<&User>, roles: &[Role]) -> bool {
    user.is_some_and(|u| roles.contains(&u.role))
}

/// Route gate: the user must hold one of `roles` (if any are listed) and
/// every one of `permissions`. No requirements admits any signed-in user.
pub fn can_access_route(user: Option<&User>, roles: &[Role], permissions: &[&str]) -> bool {
    let Some(user) = user else {
        return false;
    };
    if user.role == Role::Admin {
        return true;
    }
    if !roles.is_empty() && !roles.contains(&user.role) {
        return false;
    }
    permissions
        .iter()
        .all(|p| has_permission(Some(user), p))
}
