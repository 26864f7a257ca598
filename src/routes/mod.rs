/// Router Module Index
///
/// Routes are grouped by the access they require. Each protected route
/// carries its own `Guard` (authenticate + rule) as a route layer, so the
/// rule is declared next to the path it protects.

/// Routes open to anyone: probes and the smoke test.
pub mod public;

/// Routes that need a verified identity and an owner-or-admin check.
pub mod authenticated;

/// Routes restricted to the `ADMIN` role.
pub mod admin;
