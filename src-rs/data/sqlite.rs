//! SQLite mirror of the accounting databases: one file per company alias plus
//! the shared general database holding users and the company list.

use std::collections::BTreeMap;

use rusqlite::{params, OptionalExtension};

use super::pool::DatabasePools;
use super::{
    check_account, company_period, entry_eligible, parameters_valid, AccountCheck, AccountKind,
    CompanyRecord, DataAccess, DataError, DateRange, EntryRecord, ParameterCheck,
};

pub const GENERAL_DATABASE: &str = "GeneralesSQL";

pub struct SqliteDataAccess {
    pools: DatabasePools,
    general_database: String,
}

impl SqliteDataAccess {
    pub fn new(pools: DatabasePools) -> Self {
        Self::with_general_database(pools, GENERAL_DATABASE)
    }

    pub fn with_general_database(pools: DatabasePools, general_database: &str) -> Self {
        Self {
            pools,
            general_database: general_database.to_string(),
        }
    }

    pub fn pools(&self) -> &DatabasePools {
        &self.pools
    }
}

impl DataAccess for SqliteDataAccess {
    fn companies_for_user(&self, user: &str) -> Result<Vec<CompanyRecord>, DataError> {
        let db = self.general_database.as_str();
        self.pools.with_connection(db, |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT eu.IdEmpresa, e.Nombre, e.AliasBDD \
                     FROM EmpresasUsuario eu \
                     LEFT JOIN Usuarios u ON eu.IdUsuario = u.Id \
                     LEFT JOIN ListaEmpresas e ON eu.IdEmpresa = e.Id \
                     WHERE u.Codigo = ?1 \
                     ORDER BY eu.IdEmpresa",
                )
                .map_err(|err| DataError::query(db, err))?;
            let rows = stmt
                .query_map(params![user], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                })
                .map_err(|err| DataError::query(db, err))?;

            let mut companies = Vec::new();
            for row in rows {
                let (id, name, alias) = row.map_err(|err| DataError::query(db, err))?;
                match (name, alias) {
                    (Some(name), Some(alias)) => companies.push(CompanyRecord {
                        id,
                        name,
                        database_alias: alias,
                    }),
                    _ => log::warn!("[data] user {user} references unknown company {id}"),
                }
            }
            Ok(companies)
        })
    }

    fn entries_for_database(&self, alias: &str) -> Result<Vec<EntryRecord>, DataError> {
        self.pools.with_connection(alias, |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT a.Codigo, a.Nombre, a.TipoXML, m.FormulaCuenta \
                     FROM Asientos a \
                     LEFT JOIN MovimientosAsiento m ON a.Id = m.IdAsiento \
                     WHERE a.TipoXML IN (1, 4)",
                )
                .map_err(|err| DataError::query(alias, err))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                })
                .map_err(|err| DataError::query(alias, err))?;

            let mut grouped: BTreeMap<String, (String, i64, Vec<Option<String>>)> = BTreeMap::new();
            for row in rows {
                let (code, name, document_type, formula) =
                    row.map_err(|err| DataError::query(alias, err))?;
                grouped
                    .entry(code)
                    .or_insert_with(|| (name, document_type, Vec::new()))
                    .2
                    .push(formula);
            }

            Ok(grouped
                .into_iter()
                .filter(|(_, (name, document_type, formulas))| {
                    entry_eligible(*document_type, name, formulas)
                })
                .map(|(code, (name, document_type, _))| EntryRecord {
                    code,
                    name,
                    document_type,
                })
                .collect())
        })
    }

    fn account_code_for_company(
        &self,
        alias: &str,
        kind: AccountKind,
    ) -> Result<AccountCheck, DataError> {
        self.pools.with_connection(alias, |conn| {
            let structure: String = conn
                .query_row(
                    "SELECT EstructCta FROM Parametros ORDER BY Id LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| DataError::query(alias, err))?
                .ok_or_else(|| DataError::Missing(format!("{alias}: Parametros")))?;
            let code: Option<String> = conn
                .query_row(
                    "SELECT c.Codigo FROM Cuentas c \
                     LEFT JOIN AgrupadoresSAT a ON c.IdAgrupadorSAT = a.Id \
                     WHERE a.Codigo = ?1 AND c.Afectable = 0 AND c.EsBaja = 0 \
                     ORDER BY c.Codigo LIMIT 1",
                    params![kind.grouping_code()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| DataError::query(alias, err))?;
            Ok(check_account(kind, code.as_deref(), &structure))
        })
    }

    fn validate_operating_parameters(&self, alias: &str) -> Result<ParameterCheck, DataError> {
        self.pools.with_connection(alias, |conn| {
            let raw: Option<Option<String>> = conn
                .query_row(
                    "SELECT ParFunc FROM Parametros ORDER BY Id LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| DataError::query(alias, err))?;
            let raw = raw.flatten().unwrap_or_default();
            Ok(ParameterCheck {
                valid: parameters_valid(&raw),
                raw,
            })
        })
    }

    fn date_range_for_company(&self, alias: &str) -> Result<DateRange, DataError> {
        self.pools.with_connection(alias, |conn| {
            let row: Option<(Option<i32>, Option<u32>)> = conn
                .query_row(
                    "SELECT e.Ejercicio, p.PerActual FROM Parametros p \
                     LEFT JOIN Ejercicios e ON p.EjerActual = e.Id \
                     ORDER BY p.Id LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|err| DataError::query(alias, err))?;
            match row {
                Some((Some(year), Some(period))) => company_period(year, period),
                _ => Err(DataError::Missing(format!("{alias}: current fiscal period"))),
            }
        })
    }
}

/// Schema of the company databases, used by tests and by `contabot` fixtures.
pub const COMPANY_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS Parametros (Id INTEGER PRIMARY KEY, EstructCta TEXT, ParFunc TEXT, PerActual INTEGER, EjerActual INTEGER);
CREATE TABLE IF NOT EXISTS Ejercicios (Id INTEGER PRIMARY KEY, Ejercicio INTEGER);
CREATE TABLE IF NOT EXISTS AgrupadoresSAT (Id INTEGER PRIMARY KEY, Codigo TEXT);
CREATE TABLE IF NOT EXISTS Cuentas (Id INTEGER PRIMARY KEY, Codigo TEXT, IdAgrupadorSAT INTEGER, Afectable INTEGER, EsBaja INTEGER);
CREATE TABLE IF NOT EXISTS Asientos (Id INTEGER PRIMARY KEY, Codigo TEXT, Nombre TEXT, TipoXML INTEGER);
CREATE TABLE IF NOT EXISTS MovimientosAsiento (Id INTEGER PRIMARY KEY, IdAsiento INTEGER, FormulaCuenta TEXT);
";

pub const GENERAL_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS Usuarios (Id INTEGER PRIMARY KEY, Codigo TEXT);
CREATE TABLE IF NOT EXISTS ListaEmpresas (Id INTEGER PRIMARY KEY, Nombre TEXT, AliasBDD TEXT);
CREATE TABLE IF NOT EXISTS EmpresasUsuario (IdUsuario INTEGER, IdEmpresa INTEGER);
";
