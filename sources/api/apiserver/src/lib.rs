/*!
# Background

The workspace server keeps all of its durable state in one data directory: a SQLite database and
a tree of attached files.
This crate serves the administrative API that manages that state as a whole.

# Operations

* `GET /api/admin/backup` streams a zip archive of the database and attached files.
* `POST /api/admin/backup` takes a multipart upload of such an archive and replaces all state with
  it, then restarts the server.  Archives without `metadata.json` are accepted as legacy backups
  holding only a database.
* `GET /api/admin/config/{name}` returns a stored config record.
* `PUT /api/admin/config/{name}` validates and stores a config record, then restarts the server so
  the new configuration takes effect.
* `GET /api/admin/status` reports whether storage is running, closed for a restart, or failed.

Backup, restore, and reconfiguration are serialized through a lock file; a second one started
while another is in progress gets a 409 Conflict.
Requests that need storage get a 503 while it's closed for a restart.

# Restore safety

Before a restore deletes anything, a rollback snapshot of the database is written to
`rollback-<id>.db` in the data directory.
If the restore fails after that point, the server doesn't try to revert: it keeps the snapshot,
names it in the error, and refuses storage requests until an operator recovers from it.
*/

pub mod server;

pub use server::serve;
